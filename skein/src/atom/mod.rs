//! Atom descriptors.
//!
//! An [`Atom`] is an immutable description of a cached, long-lived computed
//! value: a factory plus its declared dependency shape, static tags, and a
//! `keep_alive` flag. Descriptors hold no state; a [`Scope`](crate::Scope)
//! caches one result per atom and drives the idle → resolving →
//! resolved/failed machine.
//!
//! Dependencies are declared on the builder and resolved before the factory
//! runs; the factory reads them back through its
//! [`ResolveCtx`](crate::ResolveCtx) by atom identity.

mod controller;

pub use controller::{
    AtomEvent, AtomEventKind, AtomStatus, Controller, EventFilter, Subscription,
};

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{BoxError, ScopeError};
use crate::registry;
use crate::scope::ResolveCtx;
use crate::tag::{TagDep, Tagged};
use crate::AnyValue;

static NEXT_ATOM_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identity of an atom descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomId(pub(crate) u64);

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom#{}", self.0)
    }
}

pub(crate) type ErasedFactory =
    Arc<dyn Fn(ResolveCtx) -> BoxFuture<'static, Result<AnyValue, ScopeError>> + Send + Sync>;

/// One entry in a declared dependency shape.
#[derive(Clone)]
pub(crate) enum DepSpec {
    /// Resolve the atom and expose its value. When `reactive`, a change to
    /// the source invalidates the dependent.
    Value {
        core: Arc<AtomCore>,
        reactive: bool,
    },
    /// Expose a controller handle. When `eager`, the target is resolved
    /// before the factory runs.
    Controller {
        core: Arc<AtomCore>,
        eager: bool,
    },
    /// A contextual tag with required / optional / all semantics.
    Tag(TagDep),
}

/// Identity, shape, and factory of an atom; shared by every clone of the
/// typed descriptor and stored erased inside scopes.
pub(crate) struct AtomCore {
    pub(crate) id: AtomId,
    pub(crate) label: Arc<str>,
    pub(crate) keep_alive: bool,
    pub(crate) deps: Vec<DepSpec>,
    pub(crate) tags: Vec<Tagged>,
    pub(crate) factory: ErasedFactory,
}

impl fmt::Debug for AtomCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomCore")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("keep_alive", &self.keep_alive)
            .field("deps", &self.deps.len())
            .finish()
    }
}

/// Immutable descriptor of a cached computed value.
///
/// Cheap to clone; clones share identity. Build with [`Atom::builder`]:
///
/// ```rust,ignore
/// use skein::{Atom, BoxError};
///
/// let counter = Atom::builder()
///     .label("counter")
///     .build(|_ctx| async move { Ok::<_, BoxError>(0u64) });
///
/// let doubled = Atom::builder()
///     .label("doubled")
///     .dep(&counter)
///     .build(move |ctx| {
///         let counter = counter.clone();
///         async move { Ok::<_, BoxError>(*ctx.get(&counter)? * 2) }
///     });
/// ```
pub struct Atom<T> {
    core: Arc<AtomCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Atom<T> {
    /// Starts a builder for a new atom.
    pub fn builder() -> AtomBuilder<T> {
        AtomBuilder {
            label: None,
            keep_alive: false,
            deps: Vec::new(),
            tags: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// The atom's identity.
    pub fn id(&self) -> AtomId {
        self.core.id
    }

    /// The diagnostic label.
    pub fn label(&self) -> &str {
        &self.core.label
    }

    /// Whether the atom opted out of garbage collection.
    pub fn keep_alive(&self) -> bool {
        self.core.keep_alive
    }

    /// Static tagged values attached to the descriptor.
    pub fn tags(&self) -> &[Tagged] {
        &self.core.tags
    }

    pub(crate) fn core(&self) -> &Arc<AtomCore> {
        &self.core
    }
}

impl<T: Clone + Send + Sync + 'static> Atom<T> {
    /// An atom whose factory yields a clone of `value`. Handy for seeds that
    /// are later driven through a controller.
    pub fn of(label: impl Into<String>, value: T) -> Atom<T> {
        Atom::builder()
            .label(label)
            .build(move |_ctx| {
                let value = value.clone();
                async move { Ok::<_, BoxError>(value) }
            })
    }
}

/// Builder for [`Atom`]. Dependency order is preserved; it becomes the
/// resolution order of the dependency phase.
pub struct AtomBuilder<T> {
    label: Option<String>,
    keep_alive: bool,
    deps: Vec<DepSpec>,
    tags: Vec<Tagged>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> AtomBuilder<T> {
    /// Sets the diagnostic label. Defaults to `atom#<id>`.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Exempts the atom from garbage collection for the scope's lifetime.
    pub fn keep_alive(mut self) -> Self {
        self.keep_alive = true;
        self
    }

    /// Declares a reactive value dependency: the value is resolved before
    /// the factory runs, and a change to it invalidates this atom.
    pub fn dep<U: Send + Sync + 'static>(mut self, atom: &Atom<U>) -> Self {
        self.deps.push(DepSpec::Value {
            core: atom.core().clone(),
            reactive: true,
        });
        self
    }

    /// Declares a non-reactive value dependency: resolved once, no
    /// invalidation edge.
    pub fn dep_static<U: Send + Sync + 'static>(mut self, atom: &Atom<U>) -> Self {
        self.deps.push(DepSpec::Value {
            core: atom.core().clone(),
            reactive: false,
        });
        self
    }

    /// Declares a controller dependency: the factory receives a handle and
    /// decides itself when (or whether) to resolve the target. The edge is
    /// reactive: a change to the target invalidates this atom.
    pub fn dep_controller<U: Send + Sync + 'static>(mut self, atom: &Atom<U>) -> Self {
        self.deps.push(DepSpec::Controller {
            core: atom.core().clone(),
            eager: false,
        });
        self
    }

    /// Declares a controller dependency whose target is resolved before the
    /// factory runs.
    pub fn dep_controller_eager<U: Send + Sync + 'static>(mut self, atom: &Atom<U>) -> Self {
        self.deps.push(DepSpec::Controller {
            core: atom.core().clone(),
            eager: true,
        });
        self
    }

    /// Declares a tag dependency built with
    /// [`required`](crate::tag::required) / [`optional`](crate::tag::optional)
    /// / [`all`](crate::tag::all).
    pub fn dep_tag(mut self, dep: TagDep) -> Self {
        self.deps.push(DepSpec::Tag(dep));
        self
    }

    /// Attaches a static tagged value to the descriptor.
    pub fn tag(mut self, tagged: Tagged) -> Self {
        self.tags.push(tagged);
        self
    }

    /// Finishes the descriptor with its factory.
    ///
    /// The factory runs inside the owning scope, at most once per
    /// generation; its error is cached as the atom's failed state.
    pub fn build<F, Fut, E>(self, factory: F) -> Atom<T>
    where
        F: Fn(ResolveCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let id = AtomId(NEXT_ATOM_ID.fetch_add(1, Ordering::Relaxed));
        let label: Arc<str> = Arc::from(self.label.unwrap_or_else(|| format!("atom#{}", id.0)));

        let factory_label = label.clone();
        let erased: ErasedFactory = Arc::new(move |ctx: ResolveCtx| {
            let fut = factory(ctx);
            let label = factory_label.clone();
            Box::pin(async move {
                match fut.await {
                    Ok(value) => Ok(Arc::new(value) as AnyValue),
                    Err(err) => Err(ScopeError::factory(label.to_string(), err)),
                }
            })
        });

        let core = Arc::new(AtomCore {
            id,
            label,
            keep_alive: self.keep_alive,
            deps: self.deps,
            tags: self.tags,
            factory: erased,
        });
        registry::register_atom(&core);
        Atom {
            core,
            _marker: PhantomData,
        }
    }
}

/// A scope-local override replacing an atom's factory output with a supplied
/// value. Built with [`preset`] and handed to the scope builder; the preset
/// map is frozen at scope creation.
#[derive(Clone)]
pub struct Preset {
    pub(crate) atom: AtomId,
    pub(crate) label: Arc<str>,
    pub(crate) value: AnyValue,
}

impl fmt::Debug for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preset")
            .field("atom", &self.atom)
            .field("label", &self.label)
            .finish()
    }
}

/// Overrides `atom` with `value` in any scope the preset is given to. The
/// atom's factory never runs there.
pub fn preset<T: Send + Sync + 'static>(atom: &Atom<T>, value: T) -> Preset {
    Preset {
        atom: atom.id(),
        label: atom.core().label.clone(),
        value: Arc::new(value),
    }
}
