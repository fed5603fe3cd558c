//! # Skein
//!
//! A lazy, cached, reactive dependency-injection and effect runtime. Define
//! long-lived computed values (**atoms**), short-lived operations (**flows**),
//! and contextual values (**tags**) at module scope; a **scope** resolves the
//! dependency graph lazily, caches results, re-resolves on invalidation, and
//! garbage-collects unreferenced state after a grace period.
//!
//! ## Design principles
//!
//! - **Descriptors are data**: [`Atom`], [`Flow`], and [`Tag`] are immutable,
//!   cheaply cloned descriptions. All state lives in the [`Scope`].
//! - **Resolve once, coalesce always**: concurrent resolves of one atom share
//!   a single factory run; a cached value is returned by reference.
//! - **Reactive edges, serial invalidation**: value dependencies invalidate
//!   their dependents on change; invalidations process in order, with loop
//!   detection.
//! - **Structured execution**: [`ExecutionContext`] trees carry tags, data,
//!   cancellation, and LIFO close callbacks; children never outlive the exec
//!   that spawned them.
//! - **Extensions wrap, never replace**: registered extensions compose around
//!   resolution and exec calls, outer to inner, in declaration order.
//!
//! ## Main modules
//!
//! - [`atom`]: [`Atom`], [`Controller`], [`preset`] — descriptors and handles.
//! - [`flow`]: [`Flow`] — input-validated ephemeral operations.
//! - [`tag`]: [`Tag`], [`TagStore`], [`tag::required`] / [`tag::optional`] /
//!   [`tag::all`] — identity-keyed contextual values.
//! - [`scope`]: [`Scope`], [`GcConfig`], [`SelectHandle`], [`ResolveCtx`] —
//!   the container and resolution engine.
//! - [`context`]: [`ExecutionContext`], [`ExecOptions`] — hierarchical
//!   per-operation runtime.
//! - [`extension`]: [`Extension`] — init/dispose lifecycle plus
//!   `wrap_resolve` / `wrap_exec` interceptors.
//! - [`registry`]: weak registries of live atoms and tags for tooling.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use skein::{Atom, BoxError, Scope};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), skein::ScopeError> {
//!     let greeting = Atom::builder()
//!         .label("greeting")
//!         .build(|_ctx| async move { Ok::<_, BoxError>("hello, world!".to_string()) });
//!
//!     let scope = Scope::new();
//!     let value = scope.resolve(&greeting).await?;
//!     println!("{}", value);
//!
//!     scope.dispose(skein::DisposeOptions::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod atom;
pub mod context;
pub mod error;
pub mod extension;
pub mod flow;
pub mod registry;
pub mod scope;
pub mod tag;

pub use atom::{
    preset, Atom, AtomBuilder, AtomEvent, AtomEventKind, AtomId, AtomStatus, Controller,
    EventFilter, Preset, Subscription,
};
pub use context::{
    CloseMode, ContextOptions, ContextState, ExecOptions, ExecutionContext,
};
pub use error::{BoxError, CleanupFailure, ParseError, ParsePhase, ScopeError, SharedError};
pub use extension::{ExecKind, ExecNext, ExecTarget, Extension, ResolveEvent, ResolveNext};
pub use flow::{Flow, FlowBuilder, FlowId};
pub use registry::{AtomInfo, TagInfo};
pub use scope::{
    Deps, DisposeOptions, GcConfig, ResolveCtx, Scope, ScopeBuilder, ScopeId, ScopeState,
    SelectHandle, SelectSubscription, DEFAULT_DISPOSE_GRACE,
};
pub use tag::{Tag, TagDep, TagId, TagMode, TagStore, Tagged};

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;

/// Erased shared value: what the scope caches and extensions see.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Cleanup callback stored LIFO on atoms and contexts.
pub(crate) type CleanupFn =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), error::BoxError>> + Send>;
