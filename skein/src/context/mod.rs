//! Hierarchical execution contexts.
//!
//! An [`ExecutionContext`] is the per-operation runtime handed to flows and
//! exec'd functions: an isolated data map, a tag store merged from scope →
//! parent → exec options, LIFO close callbacks, and a cancellation token
//! chained to the parent's. Children are created by [`ExecutionContext::exec`]
//! / [`ExecutionContext::run`] and auto-close when the driving call returns;
//! a captured child handle keeps working only until then.

mod data;

pub(crate) use data::DataMap;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BoxError, CleanupFailure, ParseError, ParsePhase, ScopeError};
use crate::extension::{compose_exec, ExecKind, ExecTarget};
use crate::flow::Flow;
use crate::scope::Scope;
use crate::tag::{Tag, TagStore, Tagged};
use crate::{AnyValue, CleanupFn};

/// Lifecycle state of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Open for execs and data writes.
    Active,
    /// Close started; children are draining and cleanups are about to run.
    Closing,
    /// Closed; every further operation fails with `context is closed`.
    Closed,
}

/// How [`ExecutionContext::close`] treats outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Wait for child execs to finish, then run close callbacks.
    Graceful,
    /// Fire the cancellation signal and run close callbacks immediately.
    Abort,
}

/// Options for [`Scope::create_context`](crate::Scope::create_context).
#[derive(Default)]
pub struct ContextOptions {
    pub(crate) tags: Vec<Tagged>,
    pub(crate) data: Vec<(Arc<str>, AnyValue)>,
}

impl ContextOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tagged value to the root context's store.
    pub fn tag(mut self, tagged: Tagged) -> Self {
        self.tags.push(tagged);
        self
    }

    /// Seeds the root context's data map.
    pub fn data<V: Send + Sync + 'static>(mut self, key: impl Into<String>, value: V) -> Self {
        self.data
            .push((Arc::from(key.into()), Arc::new(value) as AnyValue));
        self
    }
}

/// Options for one exec call.
#[derive(Default)]
pub struct ExecOptions {
    pub(crate) tags: Vec<Tagged>,
    pub(crate) name: Option<String>,
    pub(crate) timeout: Option<Duration>,
}

impl ExecOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tagged value visible to the child context (overrides inherited
    /// entries for the same tag).
    pub fn tag(mut self, tagged: Tagged) -> Self {
        self.tags.push(tagged);
        self
    }

    /// Names the child context, overriding the flow's name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Arms a timer for the exec; expiry aborts the child's signal and the
    /// call fails with the timeout error.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

pub(crate) type ExecBody =
    Box<dyn FnOnce(ExecutionContext) -> BoxFuture<'static, Result<AnyValue, ScopeError>> + Send>;

pub(crate) struct ContextInner {
    id: Uuid,
    parent: Option<ExecutionContext>,
    scope: Scope,
    name: Option<Arc<str>>,
    input: Option<AnyValue>,
    tags: Mutex<TagStore>,
    data: DataMap,
    on_close: Mutex<Vec<CleanupFn>>,
    state: Mutex<ContextState>,
    cancel: CancellationToken,
    children: AtomicUsize,
    children_idle: Notify,
    detached: AtomicBool,
}

impl ContextInner {
    fn detach_from_parent(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(parent) = &self.parent {
            let previous = parent.inner.children.fetch_sub(1, Ordering::AcqRel);
            if previous == 1 {
                parent.inner.children_idle.notify_waiters();
            }
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // An exec future dropped mid-flight never reached close().
        self.detach_from_parent();
    }
}

/// Per-operation runtime environment. Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct ExecutionContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ExecutionContext {
    pub(crate) fn new_root(scope: Scope, options: ContextOptions) -> Self {
        let mut tags = scope.tag_store_snapshot();
        for tagged in options.tags {
            tags.replace(tagged);
        }
        Self {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4(),
                parent: None,
                scope,
                name: None,
                input: None,
                tags: Mutex::new(tags),
                data: DataMap::from_entries(options.data),
                on_close: Mutex::new(Vec::new()),
                state: Mutex::new(ContextState::Active),
                cancel: CancellationToken::new(),
                children: AtomicUsize::new(0),
                children_idle: Notify::new(),
                detached: AtomicBool::new(false),
            }),
        }
    }

    fn new_child(
        &self,
        name: Option<Arc<str>>,
        input: Option<AnyValue>,
        extra_tags: &[Tagged],
    ) -> Self {
        let mut tags = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for tagged in extra_tags {
            tags.replace(tagged.clone());
        }
        self.inner.children.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4(),
                parent: Some(self.clone()),
                scope: self.inner.scope.clone(),
                name,
                input,
                tags: Mutex::new(tags),
                data: DataMap::default(),
                on_close: Mutex::new(Vec::new()),
                state: Mutex::new(ContextState::Active),
                cancel: self.inner.cancel.child_token(),
                children: AtomicUsize::new(0),
                children_idle: Notify::new(),
                detached: AtomicBool::new(false),
            }),
        }
    }

    /// Unique id of this context.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The parent context, when this one was created by an exec.
    pub fn parent(&self) -> Option<&ExecutionContext> {
        self.inner.parent.as_ref()
    }

    /// The owning scope.
    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Exec-supplied name, falling back to the flow's name.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The exec input, when this context was created by a flow exec of
    /// input type `T`.
    pub fn input<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner
            .input
            .clone()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether this context finished closing.
    pub fn closed(&self) -> bool {
        self.state() == ContextState::Closed
    }

    /// The cancellation signal. Aborting a parent cascades to children;
    /// cancellation is cooperative.
    pub fn signal(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Fails with `context is closed` after close, or with the abort error
    /// once the signal fired. Call after await points in long factories.
    pub fn ensure_active(&self) -> Result<(), ScopeError> {
        self.ensure_open()?;
        if self.inner.cancel.is_cancelled() {
            return Err(ScopeError::Aborted);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), ScopeError> {
        match self.state() {
            ContextState::Active => Ok(()),
            ContextState::Closing | ContextState::Closed => Err(ScopeError::ContextClosed),
        }
    }

    // ---- data (raw string keys) ----

    /// Reads a value from this context's own data map.
    pub fn get<V: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<V>> {
        self.inner.data.get(key)
    }

    /// Writes a value into this context's own data map.
    pub fn set<V: Send + Sync + 'static>(&self, key: &str, value: V) -> Result<(), ScopeError> {
        self.ensure_open()?;
        self.inner.data.set(key, value);
        Ok(())
    }

    /// Whether the key is present in this context's own data map.
    pub fn has(&self, key: &str) -> bool {
        self.inner.data.has(key)
    }

    /// Removes a key; returns whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.data.delete(key)
    }

    /// Returns the existing value, or stores and returns `make()`.
    pub fn get_or_set<V: Send + Sync + 'static>(
        &self,
        key: &str,
        make: impl FnOnce() -> V,
    ) -> Result<Arc<V>, ScopeError> {
        self.ensure_open()?;
        Ok(self.inner.data.get_or_set(key, make))
    }

    /// Walks `self → parent → …` through the data maps; first match wins.
    pub fn seek<V: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<V>> {
        let mut current = Some(self.clone());
        while let Some(ctx) = current {
            if let Some(value) = ctx.inner.data.get::<V>(key) {
                return Some(value);
            }
            current = ctx.inner.parent.clone();
        }
        None
    }

    // ---- tags (merged store) ----

    /// Reads a tag from this context's merged store; fails with
    /// `tag <label> required` when absent with no default.
    pub fn get_tag<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> Result<T, ScopeError> {
        let store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.get_in(&store)
    }

    /// Reads a tag, falling back to its default; `None` when truly absent.
    pub fn find_tag<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        let store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.find_in(&store)
    }

    /// Installs or replaces a tag value in this context's store.
    pub fn set_tag<T: Clone + Send + Sync + 'static>(
        &self,
        tag: &Tag<T>,
        value: T,
    ) -> Result<(), ScopeError> {
        self.ensure_open()?;
        let mut store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.set_in(&mut store, value)?;
        Ok(())
    }

    /// Whether the tag has an entry in this context's store.
    pub fn has_tag<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> bool {
        let store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.has_in(&store)
    }

    /// Removes the tag's entries from this context's store.
    pub fn delete_tag<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> bool {
        let mut store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.delete_in(&mut store)
    }

    /// Returns the existing tag value, or stores and returns `fallback`.
    pub fn get_or_set_tag<T: Clone + Send + Sync + 'static>(
        &self,
        tag: &Tag<T>,
        fallback: T,
    ) -> Result<T, ScopeError> {
        self.ensure_open()?;
        let mut store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.get_or_set_in(&mut store, fallback)
    }

    pub(crate) fn has_tag_id(&self, id: crate::tag::TagId) -> bool {
        let store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        store.has(id)
    }

    /// Every value bound to the tag in this context's store.
    pub fn all_tags<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> Vec<T> {
        let store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.all_in(&store)
    }

    /// Walks `self → parent → … → scope` through the tag stores; the first
    /// store with an entry wins, then the tag's default applies.
    pub fn seek_tag<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        let mut current = Some(self.clone());
        while let Some(ctx) = current {
            {
                let store = ctx
                    .inner
                    .tags
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if tag.has_in(&store) {
                    return tag.find_in(&store);
                }
            }
            current = ctx.inner.parent.clone();
        }
        // Entries set on the scope after this context was created are still
        // reachable here, past the merged snapshot.
        self.inner.scope.tag_find(tag)
    }

    // ---- lifecycle ----

    /// Registers a close callback; callbacks run LIFO when the context
    /// closes, whether the driving exec succeeded or failed.
    pub fn on_close<F, Fut>(&self, f: F) -> Result<(), ScopeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_open()?;
        let mut callbacks = self
            .inner
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        callbacks.push(Box::new(move || Box::pin(f())));
        Ok(())
    }

    /// Closes the context. Graceful waits for child execs; abort fires the
    /// cancellation signal first. Close callbacks run LIFO either way, and
    /// their failures are aggregated. Double-close is a no-op.
    pub async fn close(&self, mode: CloseMode) -> Result<(), ScopeError> {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                ContextState::Closed | ContextState::Closing => return Ok(()),
                ContextState::Active => *state = ContextState::Closing,
            }
        }

        if matches!(mode, CloseMode::Abort) {
            self.inner.cancel.cancel();
        } else {
            loop {
                let notified = self.inner.children_idle.notified();
                if self.inner.children.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        }

        let callbacks: Vec<CleanupFn> = {
            let mut list = self
                .inner
                .on_close
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            list.drain(..).collect()
        };
        let mut errors = Vec::new();
        for callback in callbacks.into_iter().rev() {
            if let Err(err) = callback().await {
                errors.push(Arc::from(err));
            }
        }

        self.inner.data.clear();
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *state = ContextState::Closed;
        }
        self.inner.detach_from_parent();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CleanupFailure { errors }.into())
        }
    }

    // ---- exec ----

    /// Runs a flow in a fresh child context and returns its output. The
    /// child closes when this call returns.
    pub async fn exec<I, O>(&self, flow: &Flow<I, O>, input: I) -> Result<O, ScopeError>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.exec_with(flow, input, ExecOptions::default()).await
    }

    /// [`exec`](Self::exec) with tags, a name override, or a timeout.
    pub async fn exec_with<I, O>(
        &self,
        flow: &Flow<I, O>,
        input: I,
        options: ExecOptions,
    ) -> Result<O, ScopeError>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let input = match flow.parse_fn() {
            Some(parse) => parse(input).map_err(|cause| ParseError {
                phase: ParsePhase::FlowInput,
                label: flow.label().to_string(),
                cause,
            })?,
            None => input,
        };
        let input: AnyValue = Arc::new(input);

        let target = ExecTarget {
            kind: ExecKind::Flow,
            name: flow.core().name.clone(),
        };
        let flow_core = flow.core().clone();
        let run = flow.erased_run();
        let body: ExecBody = Box::new({
            let input = input.clone();
            move |child: ExecutionContext| {
                Box::pin(async move {
                    let deps = child
                        .scope()
                        .clone()
                        .resolve_flow_deps(&flow_core, &child)
                        .await?;
                    run(child, input, deps).await
                })
            }
        });

        let mut options = options;
        let mut tags = flow.core().tags.clone();
        tags.append(&mut options.tags);
        options.tags = tags;

        let out = self.exec_erased(target, Some(input), options, body).await?;
        let out = out
            .downcast::<O>()
            .map_err(|_| ScopeError::TypeMismatch(flow.label().to_string()))?;
        Ok(match Arc::try_unwrap(out) {
            Ok(value) => value,
            Err(shared) => (*shared).clone(),
        })
    }

    /// Runs an ad-hoc async function in a fresh child context.
    pub async fn run<F, Fut, O, E>(&self, f: F) -> Result<O, ScopeError>
    where
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        O: Clone + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.run_with(ExecOptions::default(), f).await
    }

    /// [`run`](Self::run) with tags, a name, or a timeout.
    pub async fn run_with<F, Fut, O, E>(&self, options: ExecOptions, f: F) -> Result<O, ScopeError>
    where
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        O: Clone + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let name: Option<Arc<str>> = options.name.clone().map(Arc::from);
        let label: Arc<str> = name.clone().unwrap_or_else(|| Arc::from("fn"));
        let target = ExecTarget {
            kind: ExecKind::Function,
            name,
        };
        let body: ExecBody = Box::new(move |child| {
            let fut = f(child);
            Box::pin(async move {
                match fut.await {
                    Ok(value) => Ok(Arc::new(value) as AnyValue),
                    Err(err) => Err(ScopeError::exec(label.to_string(), err)),
                }
            })
        });
        let out = self.exec_erased(target, None, options, body).await?;
        let out = out
            .downcast::<O>()
            .map_err(|_| ScopeError::TypeMismatch("fn".to_string()))?;
        Ok(match Arc::try_unwrap(out) {
            Ok(value) => value,
            Err(shared) => (*shared).clone(),
        })
    }

    pub(crate) async fn exec_erased(
        &self,
        target: ExecTarget,
        input: Option<AnyValue>,
        options: ExecOptions,
        body: ExecBody,
    ) -> Result<AnyValue, ScopeError> {
        self.ensure_active()?;
        let scope = self.inner.scope.clone();
        scope.ensure_active()?;

        let name = options
            .name
            .map(Arc::from)
            .or_else(|| target.name.clone());
        let child = self.new_child(name, input, &options.tags);

        let tracked = scope.tracker().track_future({
            let child = child.clone();
            let extensions = scope.extensions().to_vec();
            async move {
                let chain = compose_exec(&extensions, target, child.clone(), {
                    let child = child.clone();
                    Box::new(move || body(child))
                });
                let mut fut = chain();
                match options.timeout {
                    None => fut.await,
                    Some(limit) => tokio::select! {
                        result = &mut fut => result,
                        _ = tokio::time::sleep(limit) => {
                            child.inner.cancel.cancel();
                            Err(ScopeError::Timeout(limit))
                        }
                    },
                }
            }
        });
        let result = tracked.await;

        let close_mode = if matches!(result, Err(ScopeError::Timeout(_))) {
            CloseMode::Abort
        } else {
            CloseMode::Graceful
        };
        let close_result = child.close(close_mode).await;

        match (result, close_result) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}
