//! Global weak registries of live atoms and tags.
//!
//! Tooling (devtools, HMR bridges) enumerates descriptors without keeping
//! them alive: entries are weak and pruned on every read.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::atom::{AtomCore, AtomId};
use crate::tag::{TagCore, TagId};

static ATOMS: Lazy<DashMap<u64, Weak<AtomCore>>> = Lazy::new(DashMap::new);
static TAGS: Lazy<DashMap<u64, Weak<TagCore>>> = Lazy::new(DashMap::new);

pub(crate) fn register_atom(core: &Arc<AtomCore>) {
    ATOMS.insert(core.id.0, Arc::downgrade(core));
}

pub(crate) fn register_tag(core: &Arc<TagCore>) {
    TAGS.insert(core.id.0, Arc::downgrade(core));
}

/// Snapshot of a live atom descriptor.
#[derive(Debug, Clone)]
pub struct AtomInfo {
    /// The atom's identity.
    pub id: AtomId,
    /// The atom's diagnostic label.
    pub label: String,
    /// Whether the atom opted out of garbage collection.
    pub keep_alive: bool,
}

/// Snapshot of a live tag.
#[derive(Debug, Clone)]
pub struct TagInfo {
    /// The tag's identity.
    pub id: TagId,
    /// The tag's diagnostic label.
    pub label: String,
}

/// Every atom descriptor still alive somewhere in the process.
pub fn atoms() -> Vec<AtomInfo> {
    let mut out = Vec::new();
    ATOMS.retain(|_, weak| match weak.upgrade() {
        Some(core) => {
            out.push(AtomInfo {
                id: core.id,
                label: core.label.to_string(),
                keep_alive: core.keep_alive,
            });
            true
        }
        None => false,
    });
    out.sort_by_key(|info| info.id.0);
    out
}

/// Every tag still alive somewhere in the process.
pub fn tags() -> Vec<TagInfo> {
    let mut out = Vec::new();
    TAGS.retain(|_, weak| match weak.upgrade() {
        Some(core) => {
            out.push(TagInfo {
                id: core.id,
                label: core.label.to_string(),
            });
            true
        }
        None => false,
    });
    out.sort_by_key(|info| info.id.0);
    out
}
