//! Per-scope, per-atom state records.
//!
//! The scope's cache maps atom identity to one record: the state machine
//! slot, cached value or error, the in-flight shared resolution, LIFO
//! cleanups, listeners, reactive edges, and GC bookkeeping. Records are only
//! touched under the scope's record lock and never across an await.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use tokio::task::JoinHandle;

use crate::atom::{AtomCore, AtomEvent, AtomEventKind, AtomId, AtomStatus, EventFilter};
use crate::context::DataMap;
use crate::error::ScopeError;
use crate::{AnyValue, CleanupFn};

/// A transition listener registered through a controller.
pub(crate) type Listener = Arc<dyn Fn(&AtomEvent) + Send + Sync>;

/// One resolution in flight; concurrent resolvers all await the same copy.
pub(crate) type SharedResolution = Shared<BoxFuture<'static, Result<AnyValue, ScopeError>>>;

pub(crate) struct ListenerEntry {
    pub(crate) id: u64,
    pub(crate) filter: EventFilter,
    pub(crate) listener: Listener,
}

pub(crate) struct AtomRecord {
    pub(crate) core: Arc<AtomCore>,
    pub(crate) status: AtomStatus,
    /// Last resolved value; kept during a re-resolution for stale reads,
    /// cleared on failure.
    pub(crate) value: Option<AnyValue>,
    /// Cached failure; cleared by the next invalidation or set.
    pub(crate) error: Option<ScopeError>,
    pub(crate) current: Option<SharedResolution>,
    /// Advances on every invalidate / set; a finishing resolution whose
    /// generation no longer matches discards its store.
    pub(crate) generation: u64,
    pub(crate) cleanups: Vec<CleanupFn>,
    pub(crate) listeners: Vec<ListenerEntry>,
    pub(crate) next_listener_id: u64,
    /// Atoms to invalidate when this one's value changes.
    pub(crate) dependents: HashSet<AtomId>,
    /// Atoms this one resolved through; release candidates during GC.
    pub(crate) dependencies: HashSet<AtomId>,
    pub(crate) ref_count: usize,
    pub(crate) gc_task: Option<JoinHandle<()>>,
    /// Factory scratch space, stable across invalidations.
    pub(crate) data: DataMap,
    /// Set by `ResolveCtx::invalidate`; honored when the factory returns.
    pub(crate) invalidate_flag: Arc<AtomicBool>,
}

impl AtomRecord {
    pub(crate) fn new(core: Arc<AtomCore>) -> Self {
        Self {
            core,
            status: AtomStatus::Idle,
            value: None,
            error: None,
            current: None,
            generation: 0,
            cleanups: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
            dependents: HashSet::new(),
            dependencies: HashSet::new(),
            ref_count: 0,
            gc_task: None,
            data: DataMap::default(),
            invalidate_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Listeners whose filter matches `kind`, in registration order.
    pub(crate) fn matching_listeners(&self, kind: AtomEventKind) -> Vec<Listener> {
        self.listeners
            .iter()
            .filter(|entry| entry.filter.matches(kind))
            .map(|entry| entry.listener.clone())
            .collect()
    }

    pub(crate) fn cancel_gc(&mut self) {
        if let Some(task) = self.gc_task.take() {
            task.abort();
        }
    }

    /// Reactive dependents in a stable order for the invalidation queue.
    pub(crate) fn dependents_sorted(&self) -> Vec<AtomId> {
        let mut out: Vec<AtomId> = self.dependents.iter().copied().collect();
        out.sort_by_key(|id| id.0);
        out
    }
}
