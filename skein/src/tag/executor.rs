//! Tag-as-dependency adapters.
//!
//! [`required`], [`optional`], and [`all`] wrap a tag so it can sit in an
//! atom's or flow's dependency list. The resolution engine checks required
//! tags before the factory runs; factories then read the values through their
//! resolve or execution context.

use std::sync::Arc;

use super::{Tag, TagId};

/// Extraction semantics for a tag dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMode {
    /// Absence (with no default) fails resolution before the factory runs.
    Required,
    /// Absence yields `None` (or the tag's default).
    Optional,
    /// Every matching value is collected; absence yields an empty list.
    All,
}

/// A tag wrapped for use as a dependency entry.
#[derive(Debug, Clone)]
pub struct TagDep {
    pub(crate) id: TagId,
    pub(crate) label: Arc<str>,
    pub(crate) mode: TagMode,
    pub(crate) has_default: bool,
}

impl TagDep {
    /// Which extraction semantics this entry declares.
    pub fn mode(&self) -> TagMode {
        self.mode
    }

    /// Label of the wrapped tag.
    pub fn label(&self) -> &str {
        &self.label
    }
}

fn wrap<T: Clone + Send + Sync + 'static>(tag: &Tag<T>, mode: TagMode) -> TagDep {
    TagDep {
        id: tag.id(),
        label: tag.core().label.clone(),
        mode,
        has_default: tag.has_default(),
    }
}

/// Declares a tag dependency that must be present (or carry a default).
pub fn required<T: Clone + Send + Sync + 'static>(tag: &Tag<T>) -> TagDep {
    wrap(tag, TagMode::Required)
}

/// Declares a tag dependency that may be absent.
pub fn optional<T: Clone + Send + Sync + 'static>(tag: &Tag<T>) -> TagDep {
    wrap(tag, TagMode::Optional)
}

/// Declares a tag dependency that collects every matching value.
pub fn all<T: Clone + Send + Sync + 'static>(tag: &Tag<T>) -> TagDep {
    wrap(tag, TagMode::All)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: The wrappers preserve tag identity and record the mode.
    #[test]
    fn wrappers_carry_identity_and_mode() {
        let tag = Tag::<String>::new("tenant");
        let req = required(&tag);
        let opt = optional(&tag);
        let every = all(&tag);

        assert_eq!(req.id, tag.id());
        assert_eq!(req.mode(), TagMode::Required);
        assert_eq!(opt.mode(), TagMode::Optional);
        assert_eq!(every.mode(), TagMode::All);
        assert_eq!(req.label(), "tenant");
    }

    /// **Scenario**: A default on the tag is visible to the required check.
    #[test]
    fn required_records_default_presence() {
        let bare = Tag::<u32>::new("limit");
        let defaulted = Tag::<u32>::new("limit").with_default(10);
        assert!(!required(&bare).has_default);
        assert!(required(&defaulted).has_default);
    }
}
