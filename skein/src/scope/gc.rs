//! Reference-counted garbage collection.
//!
//! Framework bindings signal liveness with `acquire_ref` / `release_ref`.
//! When an atom's count reaches zero (and it is not `keep_alive`), a grace
//! timer starts; re-acquiring cancels it, expiry releases the atom: cleanups
//! run LIFO, the record is removed, and newly-unreferenced dependencies are
//! checked in turn. An atom is never released while a retained dependent,
//! direct or transitive, still points at it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};

use crate::atom::{Atom, AtomCore, AtomId};
use crate::error::ScopeError;
use crate::scope::{AtomRecord, Scope, ScopeState};

impl Scope {
    /// Registers a retention reference for the atom, cancelling any pending
    /// release.
    pub fn acquire_ref<T: Send + Sync + 'static>(&self, atom: &Atom<T>) -> Result<(), ScopeError> {
        self.acquire_ref_core(atom.core())
    }

    pub(crate) fn acquire_ref_core(&self, core: &Arc<AtomCore>) -> Result<(), ScopeError> {
        self.ensure_active()?;
        let mut records = self.lock_records();
        let record = records
            .entry(core.id)
            .or_insert_with(|| AtomRecord::new(core.clone()));
        record.ref_count += 1;
        record.cancel_gc();
        Ok(())
    }

    /// Releases a retention reference; at zero the grace timer starts.
    pub fn release_ref<T: Send + Sync + 'static>(&self, atom: &Atom<T>) -> Result<(), ScopeError> {
        self.release_ref_core(atom.core())
    }

    pub(crate) fn release_ref_core(&self, core: &Arc<AtomCore>) -> Result<(), ScopeError> {
        self.ensure_active()?;
        let eligible = {
            let mut records = self.lock_records();
            let Some(record) = records.get_mut(&core.id) else {
                return Ok(());
            };
            record.ref_count = record.ref_count.saturating_sub(1);
            record.ref_count == 0 && !record.core.keep_alive && self.inner.gc.enabled
        };
        if eligible {
            self.schedule_gc(core.id);
        }
        Ok(())
    }

    fn schedule_gc(&self, atom: AtomId) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let grace = self.inner.gc.grace;
        let task = handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                Scope::from_inner(inner).collect_unreferenced(atom).await;
            }
        });
        let mut records = self.lock_records();
        match records.get_mut(&atom) {
            Some(record) => {
                record.cancel_gc();
                record.gc_task = Some(task);
            }
            None => task.abort(),
        }
    }

    /// Releases `atom` if it is still unretained, then walks its
    /// dependencies for cascading release.
    pub(crate) async fn collect_unreferenced(&self, atom: AtomId) {
        if self.state() != ScopeState::Active {
            return;
        }
        let mut worklist = vec![atom];
        while let Some(current) = worklist.pop() {
            let released = {
                let mut records = self.lock_records();
                if !records.contains_key(&current) {
                    continue;
                }
                if Self::is_retained(&records, current) {
                    if let Some(record) = records.get_mut(&current) {
                        record.gc_task = None;
                    }
                    continue;
                }
                let record = records.remove(&current);
                for other in records.values_mut() {
                    other.dependents.remove(&current);
                }
                record
            };
            let Some(mut record) = released else {
                continue;
            };
            tracing::debug!(atom = %record.core.label, "gc released");

            let cleanups: Vec<_> = record.cleanups.drain(..).collect();
            for cleanup in cleanups.into_iter().rev() {
                if let Err(err) = cleanup().await {
                    tracing::warn!(
                        atom = %record.core.label,
                        error = %err,
                        "cleanup failed during gc release"
                    );
                }
            }
            {
                let mut order = self
                    .inner
                    .resolution_order
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                order.retain(|id| *id != current);
            }

            let candidates: Vec<AtomId> = {
                let records = self.lock_records();
                record
                    .dependencies
                    .iter()
                    .copied()
                    .filter(|dep| {
                        records
                            .get(dep)
                            .map(|r| r.ref_count == 0 && !r.core.keep_alive)
                            .unwrap_or(false)
                    })
                    .collect()
            };
            worklist.extend(candidates);
        }
    }

    /// Whether the atom must be kept: `keep_alive`, a live reference, or a
    /// retained dependent anywhere above it.
    fn is_retained(records: &HashMap<AtomId, AtomRecord>, atom: AtomId) -> bool {
        fn retained(
            records: &HashMap<AtomId, AtomRecord>,
            atom: AtomId,
            visited: &mut HashSet<AtomId>,
        ) -> bool {
            let Some(record) = records.get(&atom) else {
                return false;
            };
            if record.core.keep_alive || record.ref_count > 0 {
                return true;
            }
            for (other_id, other) in records {
                if other.dependencies.contains(&atom) && visited.insert(*other_id) {
                    if retained(records, *other_id, visited) {
                        return true;
                    }
                }
            }
            false
        }
        let mut visited = HashSet::new();
        visited.insert(atom);
        retained(records, atom, &mut visited)
    }
}
