//! The resolution engine.
//!
//! `resolve` is the single entry point for atom values: cached values return
//! immediately, in-flight resolutions coalesce onto one shared future, and
//! idle atoms start a pipeline that resolves declared dependencies, threads
//! the extension wrappers, runs the factory, and stores the outcome.
//!
//! Cycle detection rides the resolution stack: every recursive dependency
//! resolve carries the chain of atoms above it and fails fast when an atom
//! reappears.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::atom::{Atom, AtomCore, AtomEvent, AtomEventKind, AtomId, AtomStatus, Controller, DepSpec};
use crate::context::{DataMap, ExecutionContext};
use crate::error::ScopeError;
use crate::extension::{compose_resolve, ResolveEvent, ResolveNext};
use crate::flow::FlowCore;
use crate::scope::record::Listener;
use crate::scope::{AtomRecord, Scope, SharedResolution};
use crate::tag::TagMode;
use crate::AnyValue;

/// Resolved dependency values, keyed by atom identity. Handed to atom and
/// flow factories; access preserves the declared shape by construction.
#[derive(Clone)]
pub struct Deps {
    values: Arc<HashMap<AtomId, AnyValue>>,
    controllers: Arc<HashSet<AtomId>>,
    scope: Scope,
    owner: Arc<str>,
}

impl Deps {
    pub(crate) fn empty(scope: Scope, owner: Arc<str>) -> Self {
        Self {
            values: Arc::new(HashMap::new()),
            controllers: Arc::new(HashSet::new()),
            scope,
            owner,
        }
    }

    pub(crate) fn new(
        scope: Scope,
        owner: Arc<str>,
        values: HashMap<AtomId, AnyValue>,
        controllers: HashSet<AtomId>,
    ) -> Self {
        Self {
            values: Arc::new(values),
            controllers: Arc::new(controllers),
            scope,
            owner,
        }
    }

    /// The resolved value of a declared value dependency.
    pub fn get<T: Send + Sync + 'static>(&self, atom: &Atom<T>) -> Result<Arc<T>, ScopeError> {
        match self.values.get(&atom.id()) {
            Some(value) => value
                .clone()
                .downcast::<T>()
                .map_err(|_| ScopeError::TypeMismatch(atom.label().to_string())),
            None => Err(ScopeError::UndeclaredDependency {
                atom: atom.label().to_string(),
                dependent: self.owner.to_string(),
            }),
        }
    }

    /// A controller for a declared controller (or value) dependency.
    pub fn controller<T: Send + Sync + 'static>(
        &self,
        atom: &Atom<T>,
    ) -> Result<Controller<T>, ScopeError> {
        if self.controllers.contains(&atom.id()) || self.values.contains_key(&atom.id()) {
            Ok(self.scope.controller(atom))
        } else {
            Err(ScopeError::UndeclaredDependency {
                atom: atom.label().to_string(),
                dependent: self.owner.to_string(),
            })
        }
    }

    /// Whether the owner declared no resolvable dependencies.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.controllers.is_empty()
    }
}

/// The environment an atom factory runs in: declared dependency values, the
/// scope tag store, per-atom scratch data (stable across invalidations),
/// cleanup registration, and deferred self-invalidation.
#[derive(Clone)]
pub struct ResolveCtx {
    scope: Scope,
    atom: AtomId,
    label: Arc<str>,
    deps: Deps,
    data: DataMap,
    invalidate_flag: Arc<AtomicBool>,
    /// The resolution chain ending at this atom; dynamic resolves extend it
    /// so cycles through factory code are still caught.
    stack: Vec<AtomId>,
}

impl ResolveCtx {
    /// The owning scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The resolved dependency values.
    pub fn deps(&self) -> &Deps {
        &self.deps
    }

    /// Shorthand for [`Deps::get`].
    pub fn get<T: Send + Sync + 'static>(&self, atom: &Atom<T>) -> Result<Arc<T>, ScopeError> {
        self.deps.get(atom)
    }

    /// Shorthand for [`Deps::controller`].
    pub fn controller<T: Send + Sync + 'static>(
        &self,
        atom: &Atom<T>,
    ) -> Result<Controller<T>, ScopeError> {
        self.deps.controller(atom)
    }

    /// Resolves an atom not named in the declared shape. The read is
    /// reactive (a change to the target invalidates this atom) and carries
    /// the current resolution chain, so cycles through factory code fail
    /// with the circular dependency error.
    pub async fn resolve<T: Send + Sync + 'static>(
        &self,
        atom: &Atom<T>,
    ) -> Result<Arc<T>, ScopeError> {
        self.scope.record_edge(self.atom, atom.core(), true);
        let value = self
            .scope
            .resolve_erased(atom.core().clone(), self.stack.clone())
            .await?;
        value
            .downcast::<T>()
            .map_err(|_| ScopeError::TypeMismatch(atom.label().to_string()))
    }

    /// Reactive snapshot read: returns the atom's cached value without
    /// resolving it, and registers a reactive edge so a change to the
    /// target invalidates this atom.
    pub fn watch<T: Send + Sync + 'static>(&self, atom: &Atom<T>) -> Option<Arc<T>> {
        self.scope.record_edge(self.atom, atom.core(), true);
        self.scope.peek(atom)
    }

    /// Reads a required tag from the scope store.
    pub fn tag<T: Clone + Send + Sync + 'static>(
        &self,
        tag: &crate::tag::Tag<T>,
    ) -> Result<T, ScopeError> {
        self.scope.tag_get(tag)
    }

    /// Reads an optional tag from the scope store.
    pub fn find_tag<T: Clone + Send + Sync + 'static>(
        &self,
        tag: &crate::tag::Tag<T>,
    ) -> Option<T> {
        self.scope.tag_find(tag)
    }

    /// Every value bound to the tag in the scope store.
    pub fn all_tags<T: Clone + Send + Sync + 'static>(&self, tag: &crate::tag::Tag<T>) -> Vec<T> {
        self.scope.tag_all(tag)
    }

    /// Registers a cleanup. Cleanups run LIFO before every re-resolution of
    /// this atom and once more on final release.
    pub fn cleanup<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), crate::error::BoxError>> + Send + 'static,
    {
        self.scope
            .push_cleanup(self.atom, Box::new(move || Box::pin(f())));
    }

    /// Schedules this atom for re-resolution once the current factory call
    /// returns.
    pub fn invalidate(&self) {
        self.invalidate_flag.store(true, Ordering::Release);
    }

    /// Reads factory scratch data; the map survives invalidations.
    pub fn get_data<V: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<V>> {
        self.data.get(key)
    }

    /// Writes factory scratch data.
    pub fn set_data<V: Send + Sync + 'static>(&self, key: &str, value: V) {
        self.data.set(key, value);
    }

    /// The atom's diagnostic label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

enum Plan {
    Done(Result<AnyValue, ScopeError>),
    Preset(AnyValue, Vec<Listener>),
    Await(SharedResolution),
    Start(SharedResolution, Vec<Listener>),
}

impl Scope {
    /// Resolves an atom to its cached value, running the factory at most
    /// once per generation. Concurrent calls coalesce onto the same
    /// resolution.
    pub async fn resolve<T: Send + Sync + 'static>(
        &self,
        atom: &Atom<T>,
    ) -> Result<Arc<T>, ScopeError> {
        self.resolve_core::<T>(atom.core()).await
    }

    pub(crate) async fn resolve_core<T: Send + Sync + 'static>(
        &self,
        core: &Arc<AtomCore>,
    ) -> Result<Arc<T>, ScopeError> {
        self.ensure_active()?;
        self.ready().await?;
        let fut = self.resolve_erased(core.clone(), Vec::new());
        let value = self.tracker().track_future(fut).await?;
        value
            .downcast::<T>()
            .map_err(|_| ScopeError::TypeMismatch(core.label.to_string()))
    }

    pub(crate) fn resolve_erased(
        &self,
        core: Arc<AtomCore>,
        stack: Vec<AtomId>,
    ) -> BoxFuture<'static, Result<AnyValue, ScopeError>> {
        let scope = self.clone();
        Box::pin(async move { scope.resolve_erased_inner(core, stack).await })
    }

    async fn resolve_erased_inner(
        &self,
        core: Arc<AtomCore>,
        stack: Vec<AtomId>,
    ) -> Result<AnyValue, ScopeError> {
        if stack.contains(&core.id) {
            return Err(ScopeError::CircularDependency(
                self.format_chain(&stack, core.id, &core.label),
            ));
        }

        let plan = {
            let mut records = self.lock_records();
            let record = records
                .entry(core.id)
                .or_insert_with(|| AtomRecord::new(core.clone()));
            match (
                record.status,
                record.value.clone(),
                record.error.clone(),
                record.current.clone(),
            ) {
                (AtomStatus::Resolved, Some(value), _, _) => Plan::Done(Ok(value)),
                (AtomStatus::Failed, _, Some(error), _) => Plan::Done(Err(error)),
                (AtomStatus::Resolving, _, _, Some(current)) => Plan::Await(current),
                _ => {
                    if let Some(preset) = self.inner.presets.get(&core.id) {
                        record.status = AtomStatus::Resolved;
                        record.value = Some(preset.value.clone());
                        record.error = None;
                        let listeners = record.matching_listeners(AtomEventKind::Resolved);
                        Plan::Preset(preset.value.clone(), listeners)
                    } else {
                        record.status = AtomStatus::Resolving;
                        let generation = record.generation;
                        let mut next_stack = stack.clone();
                        next_stack.push(core.id);
                        let shared = self.make_resolution(core.clone(), next_stack, generation);
                        record.current = Some(shared.clone());
                        let listeners = record.matching_listeners(AtomEventKind::Resolving);
                        Plan::Start(shared, listeners)
                    }
                }
            }
        };

        match plan {
            Plan::Done(result) => result,
            Plan::Await(shared) => shared.await,
            Plan::Preset(value, listeners) => {
                self.mark_resolved_order(core.id);
                self.emit_event(&core, AtomEventKind::Resolved, listeners);
                Ok(value)
            }
            Plan::Start(shared, listeners) => {
                self.emit_event(&core, AtomEventKind::Resolving, listeners);
                shared.await
            }
        }
    }

    pub(crate) fn make_resolution(
        &self,
        core: Arc<AtomCore>,
        stack: Vec<AtomId>,
        generation: u64,
    ) -> SharedResolution {
        let scope = self.clone();
        let fut: BoxFuture<'static, Result<AnyValue, ScopeError>> = Box::pin(async move {
            let result = scope.run_resolution(core.clone(), stack).await;
            scope.finish_resolution(&core, generation, &result);
            result
        });
        fut.shared()
    }

    async fn run_resolution(
        &self,
        core: Arc<AtomCore>,
        stack: Vec<AtomId>,
    ) -> Result<AnyValue, ScopeError> {
        tracing::debug!(atom = %core.label, "resolving");
        let deps = self.resolve_atom_deps(&core, &stack).await?;

        let (data, invalidate_flag) = {
            let records = self.lock_records();
            match records.get(&core.id) {
                Some(record) => (record.data.clone(), record.invalidate_flag.clone()),
                None => (DataMap::default(), Arc::new(AtomicBool::new(false))),
            }
        };
        let ctx = ResolveCtx {
            scope: self.clone(),
            atom: core.id,
            label: core.label.clone(),
            deps,
            data,
            invalidate_flag,
            stack: stack.clone(),
        };

        let event = ResolveEvent {
            scope: self.id(),
            atom: core.id,
            label: core.label.clone(),
        };
        let factory = core.factory.clone();
        let terminal: ResolveNext = Box::new(move || factory(ctx));
        let chain = compose_resolve(self.extensions(), event, terminal);
        chain().await
    }

    async fn resolve_atom_deps(
        &self,
        core: &Arc<AtomCore>,
        stack: &[AtomId],
    ) -> Result<Deps, ScopeError> {
        if core.deps.is_empty() {
            return Ok(Deps::empty(self.clone(), core.label.clone()));
        }

        let mut values = HashMap::new();
        let mut controllers = HashSet::new();
        for dep in &core.deps {
            match dep {
                DepSpec::Value {
                    core: dep_core,
                    reactive,
                } => {
                    let value = self
                        .resolve_erased(dep_core.clone(), stack.to_vec())
                        .await?;
                    values.insert(dep_core.id, value);
                    self.record_edge(core.id, dep_core, *reactive);
                }
                DepSpec::Controller {
                    core: dep_core,
                    eager,
                } => {
                    if *eager {
                        self.resolve_erased(dep_core.clone(), stack.to_vec())
                            .await?;
                    }
                    controllers.insert(dep_core.id);
                    // Controller handles are the reactive surface: a change
                    // to the target invalidates this atom.
                    self.record_edge(core.id, dep_core, true);
                }
                DepSpec::Tag(tag_dep) => {
                    if tag_dep.mode == TagMode::Required && !tag_dep.has_default {
                        let present = {
                            let store = self
                                .inner
                                .tags
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner);
                            store.has(tag_dep.id)
                        };
                        if !present {
                            return Err(ScopeError::TagRequired(tag_dep.label.to_string()));
                        }
                    }
                }
            }
        }
        Ok(Deps::new(
            self.clone(),
            core.label.clone(),
            values,
            controllers,
        ))
    }

    /// Resolves a flow's declared dependencies. Tag entries are checked
    /// against the child context's merged store rather than the scope store.
    pub(crate) async fn resolve_flow_deps(
        &self,
        core: &Arc<FlowCore>,
        ctx: &ExecutionContext,
    ) -> Result<Deps, ScopeError> {
        if core.deps.is_empty() {
            return Ok(Deps::empty(self.clone(), core.label.clone()));
        }

        let mut values = HashMap::new();
        let mut controllers = HashSet::new();
        for dep in &core.deps {
            match dep {
                DepSpec::Value { core: dep_core, .. } => {
                    let value = self.resolve_erased(dep_core.clone(), Vec::new()).await?;
                    values.insert(dep_core.id, value);
                }
                DepSpec::Controller {
                    core: dep_core,
                    eager,
                } => {
                    if *eager {
                        self.resolve_erased(dep_core.clone(), Vec::new()).await?;
                    }
                    controllers.insert(dep_core.id);
                }
                DepSpec::Tag(tag_dep) => {
                    if tag_dep.mode == TagMode::Required
                        && !tag_dep.has_default
                        && !ctx.has_tag_id(tag_dep.id)
                    {
                        return Err(ScopeError::TagRequired(tag_dep.label.to_string()));
                    }
                }
            }
        }
        Ok(Deps::new(
            self.clone(),
            core.label.clone(),
            values,
            controllers,
        ))
    }

    fn record_edge(&self, dependent: AtomId, dep_core: &Arc<AtomCore>, reactive: bool) {
        let mut records = self.lock_records();
        let dep_record = records
            .entry(dep_core.id)
            .or_insert_with(|| AtomRecord::new(dep_core.clone()));
        if reactive {
            dep_record.dependents.insert(dependent);
        }
        if let Some(record) = records.get_mut(&dependent) {
            record.dependencies.insert(dep_core.id);
        }
    }

    pub(crate) fn finish_resolution(
        &self,
        core: &Arc<AtomCore>,
        generation: u64,
        result: &Result<AnyValue, ScopeError>,
    ) {
        let (listeners, kind, deferred) = {
            let mut records = self.lock_records();
            let Some(record) = records.get_mut(&core.id) else {
                return;
            };
            if record.generation != generation {
                // Invalidated while resolving; a newer resolution owns the
                // record. The awaiters of this one still get its outcome.
                return;
            }
            record.current = None;
            let deferred = record.invalidate_flag.swap(false, Ordering::AcqRel);
            match result {
                Ok(value) => {
                    record.status = AtomStatus::Resolved;
                    record.value = Some(value.clone());
                    record.error = None;
                    (
                        record.matching_listeners(AtomEventKind::Resolved),
                        AtomEventKind::Resolved,
                        deferred,
                    )
                }
                Err(err) => {
                    record.status = AtomStatus::Failed;
                    record.value = None;
                    record.error = Some(err.clone());
                    (
                        record.matching_listeners(AtomEventKind::Failed),
                        AtomEventKind::Failed,
                        deferred,
                    )
                }
            }
        };
        if kind == AtomEventKind::Resolved {
            self.mark_resolved_order(core.id);
            tracing::debug!(atom = %core.label, "resolved");
        } else {
            tracing::debug!(atom = %core.label, "failed");
        }
        self.emit_event(core, kind, listeners);
        if deferred {
            self.enqueue_and_drain(core.id, Vec::new());
        }
    }

    pub(crate) fn emit_event(
        &self,
        core: &Arc<AtomCore>,
        kind: AtomEventKind,
        listeners: Vec<Listener>,
    ) {
        if listeners.is_empty() {
            return;
        }
        let event = AtomEvent {
            atom: core.id,
            label: core.label.clone(),
            kind,
        };
        for listener in listeners {
            listener(&event);
        }
    }

    pub(crate) fn format_chain(&self, stack: &[AtomId], repeat: AtomId, label: &Arc<str>) -> String {
        let records = self.lock_records();
        let name = |id: AtomId| -> String {
            if id == repeat {
                return label.to_string();
            }
            records
                .get(&id)
                .map(|record| record.core.label.to_string())
                .unwrap_or_else(|| id.to_string())
        };
        let start = stack.iter().position(|id| *id == repeat).unwrap_or(0);
        let mut parts: Vec<String> = stack[start..].iter().map(|id| name(*id)).collect();
        parts.push(label.to_string());
        parts.join(" -> ")
    }
}
