//! Identity-keyed contextual values.
//!
//! A [`Tag`] is a typed key with an optional default and an optional `parse`
//! validator. Tags compare by identity (the id allocated at construction),
//! never by label; labels exist for diagnostics and may collide freely.
//!
//! Bound values ([`Tagged`]) live in a [`TagStore`], an ordered sequence where
//! the latest entry for a given tag identity wins. Scopes and execution
//! contexts each carry a store; contexts inherit a merged copy from their
//! parent at creation.

mod executor;

pub use executor::{all, optional, required, TagDep, TagMode};

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ParseError, ParsePhase, ScopeError};
use crate::registry;
use crate::AnyValue;

static NEXT_TAG_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identity of a tag. Allocated once at construction; the lookup key
/// for every store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId(pub(crate) u64);

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// Identity + label of a tag, shared by every clone and by the global
/// registry.
#[derive(Debug)]
pub(crate) struct TagCore {
    pub(crate) id: TagId,
    pub(crate) label: Arc<str>,
}

type ParseFn<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// A typed contextual key with optional default and validator.
///
/// Clones share identity. Construct once at module scope and reuse:
///
/// ```rust,ignore
/// use once_cell::sync::Lazy;
/// use skein::Tag;
///
/// static USER_ID: Lazy<Tag<String>> = Lazy::new(|| Tag::new("user.id"));
/// ```
pub struct Tag<T> {
    core: Arc<TagCore>,
    default: Option<Arc<T>>,
    parse: Option<ParseFn<T>>,
}

impl<T> Clone for Tag<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            default: self.default.clone(),
            parse: self.parse.clone(),
        }
    }
}

impl<T> fmt::Debug for Tag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .field("default", &self.default.is_some())
            .field("parse", &self.parse.is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Tag<T> {
    /// Creates a tag with a fresh identity.
    pub fn new(label: impl Into<String>) -> Self {
        let id = TagId(NEXT_TAG_ID.fetch_add(1, Ordering::Relaxed));
        let core = Arc::new(TagCore {
            id,
            label: Arc::from(label.into()),
        });
        registry::register_tag(&core);
        Self {
            core,
            default: None,
            parse: None,
        }
    }

    /// Sets the value returned by `find` when no entry is present.
    pub fn with_default(mut self, value: T) -> Self {
        self.default = Some(Arc::new(value));
        self
    }

    /// Sets a validator run on every bind and store write.
    pub fn with_parse(
        mut self,
        parse: impl Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.parse = Some(Arc::new(parse));
        self
    }

    /// The tag's identity.
    pub fn id(&self) -> TagId {
        self.core.id
    }

    /// The diagnostic label.
    pub fn label(&self) -> &str {
        &self.core.label
    }

    pub(crate) fn core(&self) -> &Arc<TagCore> {
        &self.core
    }

    pub(crate) fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Binds a value to this tag, running the validator when one is set.
    pub fn bind(&self, value: T) -> Result<Tagged, ParseError> {
        if let Some(parse) = &self.parse {
            parse(&value).map_err(|cause| ParseError {
                phase: ParsePhase::Tag,
                label: self.core.label.to_string(),
                cause,
            })?;
        }
        Ok(Tagged {
            id: self.core.id,
            label: self.core.label.clone(),
            value: Arc::new(value),
        })
    }

    /// Returns the latest value for this tag, falling back to the default.
    pub fn find_in(&self, store: &TagStore) -> Option<T> {
        match store.find_raw(self.core.id) {
            Some(tagged) => downcast_tag_value(&tagged.value),
            None => self.default.as_deref().cloned(),
        }
    }

    /// Like `find_in`, but fails with `tag <label> required` when the value
    /// is absent and no default is set.
    pub fn get_in(&self, store: &TagStore) -> Result<T, ScopeError> {
        self.find_in(store)
            .ok_or_else(|| ScopeError::TagRequired(self.core.label.to_string()))
    }

    /// Installs or replaces the value for this tag.
    pub fn set_in(&self, store: &mut TagStore, value: T) -> Result<(), ParseError> {
        let tagged = self.bind(value)?;
        store.replace(tagged);
        Ok(())
    }

    /// Whether an entry is present. Defaults do not count.
    pub fn has_in(&self, store: &TagStore) -> bool {
        store.find_raw(self.core.id).is_some()
    }

    /// Removes every entry for this tag; returns whether anything was removed.
    pub fn delete_in(&self, store: &mut TagStore) -> bool {
        store.remove(self.core.id)
    }

    /// Returns the existing value, or stores and returns `fallback`.
    pub fn get_or_set_in(&self, store: &mut TagStore, fallback: T) -> Result<T, ScopeError> {
        if let Some(existing) = store.find_raw(self.core.id) {
            if let Some(value) = downcast_tag_value::<T>(&existing.value) {
                return Ok(value);
            }
        }
        self.set_in(store, fallback.clone())?;
        Ok(fallback)
    }

    /// Every value bound to this tag in the store, oldest first. Defaults are
    /// not included.
    pub fn all_in(&self, store: &TagStore) -> Vec<T> {
        store
            .all_raw(self.core.id)
            .filter_map(|tagged| downcast_tag_value(&tagged.value))
            .collect()
    }
}

fn downcast_tag_value<T: Clone + Send + Sync + 'static>(value: &AnyValue) -> Option<T> {
    value.downcast_ref::<T>().cloned()
}

/// A value bound to a tag identity. The erased form stored in tag stores and
/// attached to atom/flow descriptors.
#[derive(Clone)]
pub struct Tagged {
    pub(crate) id: TagId,
    pub(crate) label: Arc<str>,
    pub(crate) value: AnyValue,
}

impl Tagged {
    /// Identity of the owning tag.
    pub fn id(&self) -> TagId {
        self.id
    }

    /// Label of the owning tag.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The bound value, when it has type `T`.
    pub fn value<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagged")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

/// Ordered sequence of tagged values; the latest entry per identity wins.
#[derive(Clone, Default)]
pub struct TagStore {
    entries: Vec<Tagged>,
}

impl TagStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from entries, preserving order.
    pub fn from_entries(entries: impl IntoIterator<Item = Tagged>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Appends an entry. Earlier entries for the same identity are kept (for
    /// `all`) but shadowed for single-value lookups.
    pub fn insert(&mut self, tagged: Tagged) {
        self.entries.push(tagged);
    }

    /// Removes existing entries for the same identity, then appends.
    pub fn replace(&mut self, tagged: Tagged) {
        self.entries.retain(|e| e.id != tagged.id);
        self.entries.push(tagged);
    }

    /// Removes every entry for `id`; returns whether anything was removed.
    pub fn remove(&mut self, id: TagId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Appends every entry of `other`, so `other`'s values shadow this
    /// store's for single-value lookups.
    pub fn merge_from(&mut self, other: &TagStore) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Latest entry for `id`, if any.
    pub(crate) fn find_raw(&self, id: TagId) -> Option<&Tagged> {
        self.entries.iter().rev().find(|e| e.id == id)
    }

    /// Whether any entry for `id` is present.
    pub(crate) fn has(&self, id: TagId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub(crate) fn all_raw(&self, id: TagId) -> impl Iterator<Item = &Tagged> {
        self.entries.iter().filter(move |e| e.id == id)
    }

    /// Number of entries, shadowed ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for TagStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagStore")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Tags compare by identity; equal labels stay distinct keys.
    #[test]
    fn identity_not_label_is_the_key() {
        let a = Tag::<i32>::new("shared.label");
        let b = Tag::<i32>::new("shared.label");
        let mut store = TagStore::new();
        a.set_in(&mut store, 1).unwrap();
        b.set_in(&mut store, 2).unwrap();

        assert_eq!(a.find_in(&store), Some(1));
        assert_eq!(b.find_in(&store), Some(2));
    }

    /// **Scenario**: The latest entry for a tag wins single-value lookups.
    #[test]
    fn later_entry_wins() {
        let tag = Tag::<&'static str>::new("env");
        let mut store = TagStore::new();
        store.insert(tag.bind("dev").unwrap());
        store.insert(tag.bind("prod").unwrap());

        assert_eq!(tag.find_in(&store), Some("prod"));
        assert_eq!(tag.all_in(&store), vec!["dev", "prod"]);
    }

    /// **Scenario**: A default changes find to always produce a value, but
    /// has_in still reports absence.
    #[test]
    fn default_applies_to_find_only() {
        let tag = Tag::<u32>::new("retries").with_default(3);
        let store = TagStore::new();

        assert_eq!(tag.find_in(&store), Some(3));
        assert!(!tag.has_in(&store));
    }

    /// **Scenario**: get_in fails with "tag <label> required" when missing.
    #[test]
    fn get_in_requires_presence() {
        let tag = Tag::<String>::new("request.id");
        let store = TagStore::new();
        let err = tag.get_in(&store).unwrap_err();
        assert!(err.to_string().contains("request.id"));
        assert!(err.to_string().contains("required"));
    }

    /// **Scenario**: A parse validator rejects a bind with a ParseError.
    #[test]
    fn parse_runs_at_bind() {
        let tag = Tag::<i64>::new("port").with_parse(|p| {
            if (1..=65535).contains(p) {
                Ok(())
            } else {
                Err(format!("{} out of range", p))
            }
        });

        assert!(tag.bind(8080).is_ok());
        let err = tag.bind(0).unwrap_err();
        assert_eq!(err.phase, crate::error::ParsePhase::Tag);
        assert!(err.cause.contains("out of range"));
    }

    /// **Scenario**: delete_in removes all entries and reports whether any
    /// were present.
    #[test]
    fn delete_reports_removal() {
        let tag = Tag::<u8>::new("level");
        let mut store = TagStore::new();
        assert!(!tag.delete_in(&mut store));
        tag.set_in(&mut store, 1).unwrap();
        assert!(tag.delete_in(&mut store));
        assert!(!tag.has_in(&store));
    }

    /// **Scenario**: get_or_set_in returns the existing value and only stores
    /// the fallback when absent.
    #[test]
    fn get_or_set_prefers_existing() {
        let tag = Tag::<u32>::new("batch.size");
        let mut store = TagStore::new();
        assert_eq!(tag.get_or_set_in(&mut store, 16).unwrap(), 16);
        assert_eq!(tag.get_or_set_in(&mut store, 64).unwrap(), 16);
    }
}
