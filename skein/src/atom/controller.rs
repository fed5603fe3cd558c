//! Controller handles.
//!
//! A [`Controller`] is a stable, weakly-held handle onto one atom inside one
//! scope: synchronous snapshots, direct writes, invalidation, retention, and
//! transition subscriptions. Operations re-acquire the scope on every call;
//! once the scope is gone they fail with the lifecycle error.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use crate::atom::{AtomCore, AtomId};
use crate::error::ScopeError;
use crate::scope::{Scope, ScopeInner};

/// Lifecycle state of an atom within a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomStatus {
    /// Never resolved in this scope (or released by GC).
    Idle,
    /// A resolution is in flight.
    Resolving,
    /// The cached value is current.
    Resolved,
    /// The factory failed; the error is cached until the next invalidation.
    Failed,
}

impl fmt::Display for AtomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AtomStatus::Idle => "idle",
            AtomStatus::Resolving => "resolving",
            AtomStatus::Resolved => "resolved",
            AtomStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Kind of a state transition notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomEventKind {
    /// The atom entered the resolving state.
    Resolving,
    /// The atom resolved to a value.
    Resolved,
    /// The atom's factory failed.
    Failed,
}

/// A state transition of one atom.
#[derive(Clone)]
pub struct AtomEvent {
    /// The atom that transitioned.
    pub atom: AtomId,
    /// The atom's diagnostic label.
    pub label: Arc<str>,
    /// What happened.
    pub kind: AtomEventKind,
}

impl fmt::Debug for AtomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomEvent")
            .field("atom", &self.atom)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Which transitions a listener receives.
///
/// `Resolved` never fires for a failure; `Any` fires for every transition,
/// failures included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Only resolving transitions.
    Resolving,
    /// Only successful resolutions.
    Resolved,
    /// Every transition.
    Any,
}

impl EventFilter {
    pub(crate) fn matches(self, kind: AtomEventKind) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Resolving => kind == AtomEventKind::Resolving,
            EventFilter::Resolved => kind == AtomEventKind::Resolved,
        }
    }
}

/// Stable handle onto one atom in one scope.
pub struct Controller<T> {
    scope: Weak<ScopeInner>,
    core: Arc<AtomCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Controller<T> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Controller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("atom", &self.core.id)
            .field("label", &self.core.label)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Controller<T> {
    pub(crate) fn new(scope: Weak<ScopeInner>, core: Arc<AtomCore>) -> Self {
        Self {
            scope,
            core,
            _marker: PhantomData,
        }
    }

    fn scope(&self) -> Result<Scope, ScopeError> {
        self.scope
            .upgrade()
            .map(Scope::from_inner)
            .ok_or(ScopeError::Disposed)
    }

    /// The atom this controller drives.
    pub fn atom_id(&self) -> AtomId {
        self.core.id
    }

    /// Synchronous snapshot: the last resolved value, also during an
    /// in-flight re-resolution (stale read). `None` while idle, failed, or
    /// after the scope is gone.
    pub fn get(&self) -> Option<Arc<T>> {
        let scope = self.scope.upgrade().map(Scope::from_inner)?;
        scope
            .peek_erased(self.core.id)
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Current lifecycle state; `Idle` when the scope is gone.
    pub fn status(&self) -> AtomStatus {
        match self.scope.upgrade().map(Scope::from_inner) {
            Some(scope) => scope.status_erased(self.core.id),
            None => AtomStatus::Idle,
        }
    }

    /// The cached failure, when the atom is in the failed state.
    pub fn error(&self) -> Option<ScopeError> {
        let scope = self.scope.upgrade().map(Scope::from_inner)?;
        scope.error_erased(self.core.id)
    }

    /// Resolves the atom through the scope, coalescing with any in-flight
    /// resolution.
    pub async fn resolve(&self) -> Result<Arc<T>, ScopeError> {
        let scope = self.scope()?;
        scope.resolve_core::<T>(&self.core).await
    }

    /// Installs a value directly, bypassing the factory. Existing cleanups
    /// run first (LIFO); reactive dependents are invalidated before this
    /// returns.
    pub async fn set(&self, value: T) -> Result<(), ScopeError> {
        let scope = self.scope()?;
        scope.set_erased(&self.core, Arc::new(value)).await
    }

    /// Installs `f(current)` where `current` is the synchronous snapshot.
    pub async fn update<F>(&self, f: F) -> Result<(), ScopeError>
    where
        F: FnOnce(Option<Arc<T>>) -> T,
    {
        let scope = self.scope()?;
        let current = scope
            .peek_erased(self.core.id)
            .and_then(|value| value.downcast::<T>().ok());
        let next = f(current);
        scope.set_erased(&self.core, Arc::new(next)).await
    }

    /// Schedules a re-resolution. The queue drains off this call stack;
    /// await [`Scope::flush`] to observe the new value.
    pub fn invalidate(&self) -> Result<(), ScopeError> {
        let scope = self.scope()?;
        scope.schedule_invalidation(&self.core)
    }

    /// Registers a retention reference, cancelling any pending GC timer.
    pub fn acquire(&self) -> Result<(), ScopeError> {
        let scope = self.scope()?;
        scope.acquire_ref_core(&self.core)
    }

    /// Releases a retention reference; at zero the GC grace timer starts.
    pub fn release(&self) -> Result<(), ScopeError> {
        let scope = self.scope()?;
        scope.release_ref_core(&self.core)
    }

    /// Subscribes to transitions. Listeners fire synchronously, in
    /// registration order; the subscription unregisters on drop.
    pub fn on(
        &self,
        filter: EventFilter,
        listener: impl Fn(&AtomEvent) + Send + Sync + 'static,
    ) -> Result<Subscription, ScopeError> {
        let scope = self.scope()?;
        let listener_id = scope.add_listener(&self.core, filter, Arc::new(listener))?;
        Ok(Subscription {
            scope: self.scope.clone(),
            atom: self.core.id,
            listener_id,
        })
    }
}

/// Registration handle returned by [`Controller::on`]; dropping it removes
/// the listener.
pub struct Subscription {
    scope: Weak<ScopeInner>,
    atom: AtomId,
    listener_id: u64,
}

impl Subscription {
    /// Removes the listener now instead of at drop.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.scope.upgrade() {
            Scope::from_inner(inner).remove_listener(self.atom, self.listener_id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("atom", &self.atom)
            .field("listener_id", &self.listener_id)
            .finish()
    }
}
