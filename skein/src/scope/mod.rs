//! The scope: container for atom lifecycle.
//!
//! A [`Scope`] owns the atom cache, the invalidation queue, reference-counted
//! garbage collection, the extension pipeline, preset overrides, a scope-level
//! tag store, and the two-phase disposal lifecycle. Creation is synchronous;
//! extensions with async `init` complete on a background task behind the
//! [`Scope::ready`] barrier, which `resolve` awaits internally.

mod gc;
mod invalidate;
mod record;
mod resolve;
mod select;

pub use resolve::{Deps, ResolveCtx};
pub use select::{SelectHandle, SelectSubscription};

pub(crate) use record::{AtomRecord, Listener, ListenerEntry, SharedResolution};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::atom::{Atom, AtomCore, AtomId, AtomStatus, Controller, EventFilter, Preset};
use crate::context::{ContextOptions, ExecutionContext};
use crate::error::{CleanupFailure, ScopeError};
use crate::extension::Extension;
use crate::tag::{Tag, TagStore, Tagged};
use crate::{AnyValue, CleanupFn};

/// Disposal grace period applied when [`DisposeOptions::grace`] is unset.
pub const DEFAULT_DISPOSE_GRACE: Duration = Duration::from_secs(5);

/// Unique identity of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(Uuid);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// Lifecycle state of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Accepting operations.
    Active,
    /// Disposal started; new operations are rejected while in-flight ones
    /// drain within the grace period.
    Disposing,
    /// Disposal finished; every operation fails with `scope disposed`.
    Disposed,
}

/// Garbage collection configuration.
///
/// When an atom's reference count drops to zero (and it is not `keep_alive`),
/// a grace timer starts; if no reference is re-acquired before it fires, the
/// atom's cleanups run and its state is released.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Disable to keep every resolved atom for the scope's lifetime.
    pub enabled: bool,
    /// How long a zero-reference atom survives before release.
    pub grace: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace: Duration::from_secs(3),
        }
    }
}

/// Options for [`Scope::dispose`].
#[derive(Debug, Clone, Default)]
pub struct DisposeOptions {
    /// How long in-flight operations may keep running. `None` means
    /// [`DEFAULT_DISPOSE_GRACE`]; zero disposes immediately.
    pub grace: Option<Duration>,
}

impl DisposeOptions {
    /// Options with the default grace period.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the grace period.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }

    /// Zero grace: in-flight operations are not waited for.
    pub fn immediate() -> Self {
        Self {
            grace: Some(Duration::ZERO),
        }
    }
}

#[derive(Clone)]
pub(crate) enum ReadyState {
    Pending,
    Ready,
    Failed(ScopeError),
}

pub(crate) struct ScopeInner {
    pub(crate) id: ScopeId,
    pub(crate) state: Mutex<ScopeState>,
    pub(crate) records: Mutex<HashMap<AtomId, AtomRecord>>,
    /// Atom ids in first-resolution order; disposal runs cleanups in reverse.
    pub(crate) resolution_order: Mutex<Vec<AtomId>>,
    pub(crate) presets: HashMap<AtomId, Preset>,
    pub(crate) tags: Mutex<TagStore>,
    pub(crate) extensions: Vec<Arc<dyn Extension>>,
    pub(crate) gc: GcConfig,
    pub(crate) ready: watch::Receiver<ReadyState>,
    /// In-flight resolves and execs; disposal races its grace timer against
    /// this draining.
    pub(crate) ops: TaskTracker,
    /// Pending invalidations with the cascade chain that led to each.
    pub(crate) queue: Mutex<VecDeque<(AtomId, Vec<AtomId>)>>,
    /// Serializes cascade drains; invalidations process strictly in order.
    pub(crate) drain_lock: tokio::sync::Mutex<()>,
    /// Failure from a background drain, surfaced by the next `flush`.
    pub(crate) drain_error: Mutex<Option<ScopeError>>,
}

/// Builder for [`Scope`].
#[derive(Default)]
pub struct ScopeBuilder {
    tags: Vec<Tagged>,
    presets: Vec<Preset>,
    extensions: Vec<Arc<dyn Extension>>,
    gc: GcConfig,
}

impl ScopeBuilder {
    /// Adds a tagged value to the scope-level tag store.
    pub fn tag(mut self, tagged: Tagged) -> Self {
        self.tags.push(tagged);
        self
    }

    /// Overrides an atom with a preset value; its factory never runs here.
    pub fn preset(mut self, preset: Preset) -> Self {
        self.presets.push(preset);
        self
    }

    /// Registers an extension. Declaration order is pipeline order, outer to
    /// inner.
    pub fn extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Sets the garbage collection configuration.
    pub fn gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    /// Builds the scope. Synchronous; extension `init`s run behind the
    /// ready barrier (which requires a Tokio runtime when extensions are
    /// present).
    pub fn build(self) -> Scope {
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
        let presets = self
            .presets
            .into_iter()
            .map(|preset| (preset.atom, preset))
            .collect();
        let scope = Scope {
            inner: Arc::new(ScopeInner {
                id: ScopeId(Uuid::new_v4()),
                state: Mutex::new(ScopeState::Active),
                records: Mutex::new(HashMap::new()),
                resolution_order: Mutex::new(Vec::new()),
                presets,
                tags: Mutex::new(TagStore::from_entries(self.tags)),
                extensions: self.extensions,
                gc: self.gc,
                ready: ready_rx,
                ops: TaskTracker::new(),
                queue: Mutex::new(VecDeque::new()),
                drain_lock: tokio::sync::Mutex::new(()),
                drain_error: Mutex::new(None),
            }),
        };

        if scope.inner.extensions.is_empty() {
            let _ = ready_tx.send(ReadyState::Ready);
        } else {
            let init_scope = scope.clone();
            tokio::spawn(async move {
                let mut outcome = ReadyState::Ready;
                for extension in &init_scope.inner.extensions {
                    if let Err(err) = extension.init(&init_scope).await {
                        tracing::warn!(
                            extension = extension.name(),
                            error = %err,
                            "extension init failed"
                        );
                        outcome = ReadyState::Failed(err);
                        break;
                    }
                }
                let _ = ready_tx.send(outcome);
            });
        }
        scope
    }
}

/// Container owning atom caches, execution contexts, extensions, and the
/// disposal lifecycle. Cheap to clone; clones share the container.
#[derive(Clone)]
pub struct Scope {
    pub(crate) inner: Arc<ScopeInner>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// A scope with no tags, presets, or extensions and default GC.
    pub fn new() -> Scope {
        Scope::builder().build()
    }

    /// Starts a builder.
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::default()
    }

    pub(crate) fn from_inner(inner: Arc<ScopeInner>) -> Scope {
        Scope { inner }
    }

    /// Unique id of this scope.
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScopeState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn ensure_active(&self) -> Result<(), ScopeError> {
        match self.state() {
            ScopeState::Active => Ok(()),
            ScopeState::Disposing => Err(ScopeError::Disposing),
            ScopeState::Disposed => Err(ScopeError::Disposed),
        }
    }

    pub(crate) fn lock_records(&self) -> MutexGuard<'_, HashMap<AtomId, AtomRecord>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn extensions(&self) -> &[Arc<dyn Extension>] {
        &self.inner.extensions
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.inner.ops
    }

    /// Completes when extension initialization finished; fails with the
    /// first init error. Awaited internally at the start of every resolve.
    pub async fn ready(&self) -> Result<(), ScopeError> {
        let mut rx = self.inner.ready.clone();
        loop {
            let state = rx.borrow().clone();
            match state {
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(err) => return Err(err),
                ReadyState::Pending => {
                    if rx.changed().await.is_err() {
                        // Sender gone; nothing further will arrive.
                        let state = rx.borrow().clone();
                        return match state {
                            ReadyState::Failed(err) => Err(err),
                            _ => Ok(()),
                        };
                    }
                }
            }
        }
    }

    /// A stable handle for one atom: snapshots, writes, invalidation,
    /// retention, and subscriptions.
    pub fn controller<T: Send + Sync + 'static>(&self, atom: &Atom<T>) -> Controller<T> {
        Controller::new(Arc::downgrade(&self.inner), atom.core().clone())
    }

    /// Creates a root execution context carrying the scope tags merged with
    /// `options` tags.
    pub fn create_context(
        &self,
        options: ContextOptions,
    ) -> Result<ExecutionContext, ScopeError> {
        self.ensure_active()?;
        Ok(ExecutionContext::new_root(self.clone(), options))
    }

    /// Synchronous snapshot of an atom's cached value. Present while
    /// resolved, and during a re-resolution (stale read); absent while idle
    /// or failed.
    pub fn peek<T: Send + Sync + 'static>(&self, atom: &Atom<T>) -> Option<Arc<T>> {
        self.peek_erased(atom.id())
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub(crate) fn peek_erased(&self, id: AtomId) -> Option<AnyValue> {
        let records = self.lock_records();
        records.get(&id).and_then(|record| match record.status {
            AtomStatus::Resolved | AtomStatus::Resolving => record.value.clone(),
            AtomStatus::Idle | AtomStatus::Failed => None,
        })
    }

    /// Current lifecycle state of an atom in this scope.
    pub fn status<T: Send + Sync + 'static>(&self, atom: &Atom<T>) -> AtomStatus {
        self.status_erased(atom.id())
    }

    pub(crate) fn status_erased(&self, id: AtomId) -> AtomStatus {
        let records = self.lock_records();
        records
            .get(&id)
            .map(|record| record.status)
            .unwrap_or(AtomStatus::Idle)
    }

    pub(crate) fn error_erased(&self, id: AtomId) -> Option<ScopeError> {
        let records = self.lock_records();
        records.get(&id).and_then(|record| record.error.clone())
    }

    pub(crate) fn add_listener(
        &self,
        core: &Arc<AtomCore>,
        filter: EventFilter,
        listener: Listener,
    ) -> Result<u64, ScopeError> {
        self.ensure_active()?;
        let mut records = self.lock_records();
        let record = records
            .entry(core.id)
            .or_insert_with(|| AtomRecord::new(core.clone()));
        let id = record.next_listener_id;
        record.next_listener_id += 1;
        record.listeners.push(ListenerEntry {
            id,
            filter,
            listener,
        });
        Ok(id)
    }

    pub(crate) fn remove_listener(&self, atom: AtomId, listener_id: u64) {
        let mut records = self.lock_records();
        if let Some(record) = records.get_mut(&atom) {
            record.listeners.retain(|entry| entry.id != listener_id);
        }
    }

    pub(crate) fn push_cleanup(&self, atom: AtomId, cleanup: CleanupFn) {
        let mut records = self.lock_records();
        if let Some(record) = records.get_mut(&atom) {
            record.cleanups.push(cleanup);
        }
    }

    pub(crate) fn mark_resolved_order(&self, atom: AtomId) {
        let mut order = self
            .inner
            .resolution_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !order.contains(&atom) {
            order.push(atom);
        }
    }

    // ---- scope-level tag helpers ----

    pub(crate) fn tag_store_snapshot(&self) -> TagStore {
        self.inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reads a tag from the scope store; fails with `tag <label> required`
    /// when absent with no default.
    pub fn tag_get<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> Result<T, ScopeError> {
        let store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.get_in(&store)
    }

    /// Reads a tag, falling back to its default.
    pub fn tag_find<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        let store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.find_in(&store)
    }

    /// Installs or replaces a tag value in the scope store.
    pub fn tag_set<T: Clone + Send + Sync + 'static>(
        &self,
        tag: &Tag<T>,
        value: T,
    ) -> Result<(), ScopeError> {
        self.ensure_active()?;
        let mut store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.set_in(&mut store, value)?;
        Ok(())
    }

    /// Whether the tag has an entry in the scope store.
    pub fn tag_has<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> bool {
        let store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.has_in(&store)
    }

    /// Removes the tag's entries from the scope store.
    pub fn tag_delete<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> bool {
        let mut store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.delete_in(&mut store)
    }

    /// Returns the existing tag value, or stores and returns `fallback`.
    pub fn tag_get_or_set<T: Clone + Send + Sync + 'static>(
        &self,
        tag: &Tag<T>,
        fallback: T,
    ) -> Result<T, ScopeError> {
        self.ensure_active()?;
        let mut store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.get_or_set_in(&mut store, fallback)
    }

    /// Every value bound to the tag in the scope store.
    pub fn tag_all<T: Clone + Send + Sync + 'static>(&self, tag: &Tag<T>) -> Vec<T> {
        let store = self
            .inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tag.all_in(&store)
    }

    // ---- disposal ----

    /// Two-phase disposal. New operations fail immediately with
    /// `scope is disposing`; in-flight ones get the grace period to finish.
    /// Then every resolved atom's cleanups run (LIFO per atom, reverse
    /// resolution order across atoms), extensions are disposed in reverse
    /// declaration order, caches clear, and the scope is `Disposed`.
    pub async fn dispose(&self, options: DisposeOptions) -> Result<(), ScopeError> {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                ScopeState::Active => *state = ScopeState::Disposing,
                ScopeState::Disposing => return Err(ScopeError::Disposing),
                ScopeState::Disposed => return Err(ScopeError::Disposed),
            }
        }
        let grace = options.grace.unwrap_or(DEFAULT_DISPOSE_GRACE);
        tracing::debug!(scope = %self.inner.id, ?grace, "dispose started");

        self.inner.ops.close();
        if !grace.is_zero() {
            let _ = tokio::time::timeout(grace, self.inner.ops.wait()).await;
        }

        let batches: Vec<(Arc<str>, Vec<CleanupFn>)> = {
            let order: Vec<AtomId> = {
                let order = self
                    .inner
                    .resolution_order
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                order.iter().rev().copied().collect()
            };
            let mut records = self.lock_records();
            order
                .into_iter()
                .filter_map(|id| {
                    records.get_mut(&id).map(|record| {
                        (
                            record.core.label.clone(),
                            record.cleanups.drain(..).collect::<Vec<_>>(),
                        )
                    })
                })
                .collect()
        };
        let mut errors = Vec::new();
        for (label, cleanups) in batches {
            for cleanup in cleanups.into_iter().rev() {
                if let Err(err) = cleanup().await {
                    tracing::warn!(atom = %label, error = %err, "cleanup failed during dispose");
                    errors.push(Arc::from(err));
                }
            }
        }

        for extension in self.inner.extensions.iter().rev() {
            if let Err(err) = extension.dispose(self).await {
                tracing::warn!(
                    extension = extension.name(),
                    error = %err,
                    "extension dispose failed"
                );
            }
        }

        {
            let mut records = self.lock_records();
            for record in records.values_mut() {
                record.cancel_gc();
                record.listeners.clear();
            }
            records.clear();
        }
        self.inner
            .resolution_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *state = ScopeState::Disposed;
        }
        tracing::debug!(scope = %self.inner.id, "dispose finished");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CleanupFailure { errors }.into())
        }
    }
}
