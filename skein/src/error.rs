//! Error taxonomy for the runtime.
//!
//! One public enum, [`ScopeError`], covers everything a scope, context,
//! controller, or exec call can fail with. Parse failures from tag and flow
//! validators are their own type ([`ParseError`]) so callers can match on the
//! phase; aggregated cleanup failures are [`CleanupFailure`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error type accepted from user factories, flows, and cleanups.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared error type stored in cached failure states.
///
/// Cached errors are re-thrown to every later awaiter, so the source must be
/// cheap to clone.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Which validator rejected the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    /// A tag's `parse` hook rejected a bound value.
    Tag,
    /// A flow's `parse` hook rejected the exec input.
    FlowInput,
}

impl fmt::Display for ParsePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsePhase::Tag => write!(f, "tag"),
            ParsePhase::FlowInput => write!(f, "flow input"),
        }
    }
}

/// A tag or flow `parse` hook rejected its input.
#[derive(Debug, Clone, Error)]
#[error("{phase} parse failed for {label}: {cause}")]
pub struct ParseError {
    /// Whether a tag binding or a flow input was being validated.
    pub phase: ParsePhase,
    /// Label of the tag or flow that owns the validator.
    pub label: String,
    /// The validator's own message.
    pub cause: String,
}

/// One or more cleanup callbacks failed.
///
/// Cleanup callbacks keep running after an earlier one fails; every failure
/// is collected here and surfaced to whoever awaited the close, invalidation,
/// or disposal that triggered them.
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    /// Every error raised by a cleanup callback, in the order they ran.
    pub errors: Vec<SharedError>,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.first() {
            Some(first) => write!(
                f,
                "{} cleanup callback(s) failed: {}",
                self.errors.len(),
                first
            ),
            None => write!(f, "0 cleanup callbacks failed"),
        }
    }
}

impl std::error::Error for CleanupFailure {}

/// Errors surfaced by scope, context, controller, and exec operations.
#[derive(Debug, Clone, Error)]
pub enum ScopeError {
    /// A new operation was started while the scope is in its disposal grace
    /// period.
    #[error("scope is disposing")]
    Disposing,

    /// An operation was attempted on a scope that finished disposal, or
    /// through a handle whose scope is gone.
    #[error("scope disposed")]
    Disposed,

    /// An operation was attempted on an execution context after it closed.
    #[error("context is closed")]
    ContextClosed,

    /// An atom appeared twice in its own resolution stack.
    #[error("circular dependency: {0}")]
    CircularDependency(String),

    /// An invalidation cascade revisited an atom it already processed.
    #[error("invalidation loop: {0}")]
    InvalidationLoop(String),

    /// A required tag was absent from the consulted store and has no default.
    #[error("tag {0} required")]
    TagRequired(String),

    /// A tag or flow validator rejected input.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// An atom factory failed; the atom is now in the failed state and this
    /// error is re-thrown to later resolvers until the next invalidation.
    #[error("factory for {label} failed: {source}")]
    Factory {
        /// Label of the failing atom.
        label: String,
        /// The factory's own error.
        #[source]
        source: SharedError,
    },

    /// A flow factory or exec'd function failed.
    #[error("exec {label} failed: {source}")]
    Exec {
        /// Name of the flow or function, when one was supplied.
        label: String,
        /// The underlying error.
        #[source]
        source: SharedError,
    },

    /// An exec exceeded its configured timeout; the child context was
    /// signalled to abort.
    #[error("exec timed out after {0:?}")]
    Timeout(Duration),

    /// The surrounding execution context's cancellation signal fired.
    #[error("operation aborted")]
    Aborted,

    /// Cleanup callbacks failed while closing a context, invalidating an
    /// atom, or disposing a scope.
    #[error(transparent)]
    Cleanup(#[from] CleanupFailure),

    /// A cached or supplied value did not have the expected type.
    #[error("value for {0} has unexpected type")]
    TypeMismatch(String),

    /// A factory asked for an atom it never declared as a dependency.
    #[error("atom {atom} is not a declared dependency of {dependent}")]
    UndeclaredDependency {
        /// The atom that was asked for.
        atom: String,
        /// The atom or flow whose factory asked.
        dependent: String,
    },
}

impl ScopeError {
    /// Wraps a user factory error for the atom with the given label.
    pub fn factory(label: impl Into<String>, err: impl Into<BoxError>) -> Self {
        ScopeError::Factory {
            label: label.into(),
            source: Arc::from(err.into()),
        }
    }

    /// Wraps a flow or function error for the exec with the given label.
    pub fn exec(label: impl Into<String>, err: impl Into<BoxError>) -> Self {
        ScopeError::Exec {
            label: label.into(),
            source: Arc::from(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Display of CircularDependency contains the chain.
    #[test]
    fn circular_dependency_display_contains_chain() {
        let err = ScopeError::CircularDependency("a -> b -> a".to_string());
        let s = err.to_string();
        assert!(
            s.contains("circular dependency"),
            "Display should name the failure: {}",
            s
        );
        assert!(s.contains("a -> b -> a"), "Display should contain the chain: {}", s);
    }

    /// **Scenario**: Display of TagRequired contains the tag label.
    #[test]
    fn tag_required_display_contains_label() {
        let err = ScopeError::TagRequired("user.id".to_string());
        let s = err.to_string();
        assert!(s.contains("user.id"), "Display should contain the label: {}", s);
        assert!(s.contains("required"), "Display should say required: {}", s);
    }

    /// **Scenario**: ParseError carries phase, label, and cause in its Display.
    #[test]
    fn parse_error_display() {
        let err = ParseError {
            phase: ParsePhase::FlowInput,
            label: "checkout".to_string(),
            cause: "amount must be positive".to_string(),
        };
        let s = err.to_string();
        assert!(s.contains("flow input"), "Display should contain the phase: {}", s);
        assert!(s.contains("checkout"), "Display should contain the label: {}", s);
        assert!(s.contains("positive"), "Display should contain the cause: {}", s);
    }

    /// **Scenario**: CleanupFailure reports the failure count and first cause.
    #[test]
    fn cleanup_failure_display_counts() {
        let failure = CleanupFailure {
            errors: vec![
                Arc::from(Box::<dyn std::error::Error + Send + Sync>::from("socket left open")),
                Arc::from(Box::<dyn std::error::Error + Send + Sync>::from("file lock held")),
            ],
        };
        let s = failure.to_string();
        assert!(s.contains('2'), "Display should contain the count: {}", s);
        assert!(s.contains("socket left open"), "Display should contain the first cause: {}", s);
    }
}
