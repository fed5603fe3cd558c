//! Invalidation queue and reactive cascades.
//!
//! Invalidations process serially, in enqueue order, under a single drain
//! lock: cleanups run LIFO, the factory re-runs, and on a value change every
//! reactive dependent is enqueued behind the cascade chain that produced it.
//! A chain revisiting an atom is an invalidation loop and fails the drain.
//!
//! `Controller::set` / `update` drain inline so cascade failures surface to
//! the writer; `Controller::invalidate` defers to a spawned drain observed
//! through [`Scope::flush`].

use std::sync::{Arc, PoisonError};

use crate::atom::{AtomCore, AtomEventKind, AtomId, AtomStatus};
use crate::error::{CleanupFailure, ScopeError};
use crate::scope::{AtomRecord, Scope};
use crate::{AnyValue, CleanupFn};

impl Scope {
    /// Schedules a re-resolution of the atom; the queue drains off this call
    /// stack. Await [`Scope::flush`] to observe the result.
    pub(crate) fn schedule_invalidation(&self, core: &Arc<AtomCore>) -> Result<(), ScopeError> {
        self.ensure_active()?;
        self.enqueue_and_drain(core.id, Vec::new());
        Ok(())
    }

    pub(crate) fn enqueue_and_drain(&self, atom: AtomId, chain: Vec<AtomId>) {
        self.push_queue(atom, chain);
        self.spawn_drain();
    }

    fn push_queue(&self, atom: AtomId, chain: Vec<AtomId>) {
        let mut queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.push_back((atom, chain));
    }

    fn spawn_drain(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let scope = self.clone();
        handle.spawn(async move {
            if let Err(err) = scope.drain_invalidations().await {
                tracing::warn!(error = %err, "invalidation drain failed");
                let mut slot = scope
                    .inner
                    .drain_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *slot = Some(err);
            }
        });
    }

    /// Awaits every pending invalidation. Surfaces loop and cleanup errors,
    /// including those from drains that ran in the background since the last
    /// flush.
    pub async fn flush(&self) -> Result<(), ScopeError> {
        let result = self.drain_invalidations().await;
        let stored = {
            let mut slot = self
                .inner
                .drain_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        match stored {
            Some(err) => Err(err),
            None => result,
        }
    }

    pub(crate) async fn drain_invalidations(&self) -> Result<(), ScopeError> {
        let _guard = self.inner.drain_lock.lock().await;
        loop {
            let next = {
                let mut queue = self
                    .inner
                    .queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                queue.pop_front()
            };
            let Some((atom, chain)) = next else {
                return Ok(());
            };
            if chain.contains(&atom) {
                let mut queue = self
                    .inner
                    .queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                queue.clear();
                return Err(ScopeError::InvalidationLoop(self.format_loop(&chain, atom)));
            }
            self.reresolve(atom, chain).await?;
        }
    }

    /// Runs one invalidation: cleanups, generation bump, factory re-run,
    /// then dependents enqueue behind the extended chain. A factory failure
    /// caches the failed state without aborting the drain.
    async fn reresolve(&self, atom: AtomId, chain: Vec<AtomId>) -> Result<(), ScopeError> {
        let taken = {
            let mut records = self.lock_records();
            match records.get_mut(&atom) {
                // Released (GC) or never resolved; nothing to re-run.
                None => None,
                Some(record) if record.status == AtomStatus::Idle => None,
                Some(record) => Some((
                    record.core.clone(),
                    record.cleanups.drain(..).collect::<Vec<CleanupFn>>(),
                )),
            }
        };
        let Some((core, cleanups)) = taken else {
            return Ok(());
        };

        tracing::debug!(atom = %core.label, "invalidating");
        self.run_cleanups_lifo(cleanups).await.map_err(|err| {
            let mut queue = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.clear();
            err
        })?;

        let (shared, listeners) = {
            let mut records = self.lock_records();
            let Some(record) = records.get_mut(&atom) else {
                return Ok(());
            };
            record.generation += 1;
            let generation = record.generation;
            record.status = AtomStatus::Resolving;
            record.error = None;
            let shared = self.make_resolution(core.clone(), vec![atom], generation);
            record.current = Some(shared.clone());
            (shared, record.matching_listeners(AtomEventKind::Resolving))
        };
        self.emit_event(&core, AtomEventKind::Resolving, listeners);

        if shared.await.is_ok() {
            let dependents = {
                let records = self.lock_records();
                records
                    .get(&atom)
                    .map(|record| record.dependents_sorted())
                    .unwrap_or_default()
            };
            let mut next_chain = chain;
            next_chain.push(atom);
            for dependent in dependents {
                self.push_queue(dependent, next_chain.clone());
            }
        }
        Ok(())
    }

    /// Installs a value directly, bypassing the factory: existing cleanups
    /// run LIFO, the generation advances, listeners fire, and reactive
    /// dependents are invalidated before this returns.
    pub(crate) async fn set_erased(
        &self,
        core: &Arc<AtomCore>,
        value: AnyValue,
    ) -> Result<(), ScopeError> {
        self.ensure_active()?;

        let cleanups: Vec<CleanupFn> = {
            let mut records = self.lock_records();
            let record = records
                .entry(core.id)
                .or_insert_with(|| AtomRecord::new(core.clone()));
            record.cleanups.drain(..).collect()
        };
        let cleanup_result = self.run_cleanups_lifo(cleanups).await;

        let (listeners, dependents) = {
            let mut records = self.lock_records();
            let Some(record) = records.get_mut(&core.id) else {
                return Err(ScopeError::Disposed);
            };
            record.generation += 1;
            record.status = AtomStatus::Resolved;
            record.value = Some(value);
            record.error = None;
            record.current = None;
            (
                record.matching_listeners(AtomEventKind::Resolved),
                record.dependents_sorted(),
            )
        };
        self.mark_resolved_order(core.id);
        self.emit_event(core, AtomEventKind::Resolved, listeners);

        for dependent in dependents {
            self.push_queue(dependent, vec![core.id]);
        }
        self.drain_invalidations().await?;

        cleanup_result
    }

    async fn run_cleanups_lifo(&self, cleanups: Vec<CleanupFn>) -> Result<(), ScopeError> {
        let mut errors = Vec::new();
        for cleanup in cleanups.into_iter().rev() {
            if let Err(err) = cleanup().await {
                errors.push(Arc::from(err));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CleanupFailure { errors }.into())
        }
    }

    pub(crate) fn format_loop(&self, chain: &[AtomId], repeat: AtomId) -> String {
        let records = self.lock_records();
        let name = |id: AtomId| -> String {
            records
                .get(&id)
                .map(|record| record.core.label.to_string())
                .unwrap_or_else(|| id.to_string())
        };
        let start = chain.iter().position(|id| *id == repeat).unwrap_or(0);
        let mut parts: Vec<String> = chain[start..].iter().map(|id| name(*id)).collect();
        parts.push(name(repeat));
        parts.join(" -> ")
    }
}
