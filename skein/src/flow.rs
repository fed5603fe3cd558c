//! Flow descriptors.
//!
//! A [`Flow`] describes an ephemeral operation: typed input in, output out,
//! run inside a child execution context rather than cached in the scope.
//! Flows share the atom dependency shapes (value / controller / tag) and add
//! an optional `parse` validator applied to the input at exec entry.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::atom::{Atom, DepSpec};
use crate::context::ExecutionContext;
use crate::error::{BoxError, ScopeError};
use crate::scope::Deps;
use crate::tag::{TagDep, Tagged};
use crate::AnyValue;

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identity of a flow descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

pub(crate) type ErasedFlowRun = Arc<
    dyn Fn(ExecutionContext, AnyValue, Deps) -> BoxFuture<'static, Result<AnyValue, ScopeError>>
        + Send
        + Sync,
>;

pub(crate) struct FlowCore {
    pub(crate) id: FlowId,
    pub(crate) name: Option<Arc<str>>,
    pub(crate) label: Arc<str>,
    pub(crate) deps: Vec<DepSpec>,
    pub(crate) tags: Vec<Tagged>,
}

type ParseFn<I> = Arc<dyn Fn(I) -> Result<I, String> + Send + Sync>;

/// Descriptor of an ephemeral operation executed with
/// [`ExecutionContext::exec`](crate::ExecutionContext::exec).
pub struct Flow<I, O> {
    core: Arc<FlowCore>,
    parse: Option<ParseFn<I>>,
    run: ErasedFlowRun,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for Flow<I, O> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            parse: self.parse.clone(),
            run: self.run.clone(),
            _marker: PhantomData,
        }
    }
}

impl<I, O> fmt::Debug for Flow<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .finish()
    }
}

impl<I, O> Flow<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Starts a builder for a new flow.
    pub fn builder() -> FlowBuilder<I, O> {
        FlowBuilder {
            name: None,
            deps: Vec::new(),
            tags: Vec::new(),
            parse: None,
            _marker: PhantomData,
        }
    }

    /// The flow's identity.
    pub fn id(&self) -> FlowId {
        self.core.id
    }

    /// The observability name, when one was set.
    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    /// Name if set, otherwise `flow#<id>`.
    pub fn label(&self) -> &str {
        &self.core.label
    }

    /// Static tagged values attached to the descriptor; merged into every
    /// child context this flow runs in.
    pub fn tags(&self) -> &[Tagged] {
        &self.core.tags
    }

    pub(crate) fn core(&self) -> &Arc<FlowCore> {
        &self.core
    }

    pub(crate) fn parse_fn(&self) -> Option<&ParseFn<I>> {
        self.parse.as_ref()
    }

    pub(crate) fn erased_run(&self) -> ErasedFlowRun {
        self.run.clone()
    }
}

/// Builder for [`Flow`].
pub struct FlowBuilder<I, O> {
    name: Option<String>,
    deps: Vec<DepSpec>,
    tags: Vec<Tagged>,
    parse: Option<ParseFn<I>>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> FlowBuilder<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Names the flow for errors, extensions, and child context names.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares a reactive value dependency resolved before the factory runs.
    pub fn dep<U: Send + Sync + 'static>(mut self, atom: &Atom<U>) -> Self {
        self.deps.push(DepSpec::Value {
            core: atom.core().clone(),
            reactive: true,
        });
        self
    }

    /// Declares a controller dependency.
    pub fn dep_controller<U: Send + Sync + 'static>(mut self, atom: &Atom<U>) -> Self {
        self.deps.push(DepSpec::Controller {
            core: atom.core().clone(),
            eager: false,
        });
        self
    }

    /// Declares a controller dependency whose target is resolved eagerly.
    pub fn dep_controller_eager<U: Send + Sync + 'static>(mut self, atom: &Atom<U>) -> Self {
        self.deps.push(DepSpec::Controller {
            core: atom.core().clone(),
            eager: true,
        });
        self
    }

    /// Declares a tag dependency, checked against the child execution
    /// context's merged tag store.
    pub fn dep_tag(mut self, dep: TagDep) -> Self {
        self.deps.push(DepSpec::Tag(dep));
        self
    }

    /// Attaches a static tagged value to the descriptor.
    pub fn tag(mut self, tagged: Tagged) -> Self {
        self.tags.push(tagged);
        self
    }

    /// Sets a validator run on the raw input at exec entry. Failure rejects
    /// the exec with a flow-input [`ParseError`](crate::ParseError) before a
    /// child context is created.
    pub fn parse(mut self, parse: impl Fn(I) -> Result<I, String> + Send + Sync + 'static) -> Self {
        self.parse = Some(Arc::new(parse));
        self
    }

    /// Finishes the descriptor with its factory.
    pub fn build<F, Fut, E>(self, factory: F) -> Flow<I, O>
    where
        F: Fn(ExecutionContext, I, Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let id = FlowId(NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed));
        let name: Option<Arc<str>> = self.name.map(Arc::from);
        let label: Arc<str> = match &name {
            Some(name) => name.clone(),
            None => Arc::from(format!("flow#{}", id.0)),
        };

        let run_label = label.clone();
        let run: ErasedFlowRun = Arc::new(move |ctx, input: AnyValue, deps| {
            let label = run_label.clone();
            let input = match input.downcast::<I>() {
                Ok(input) => (*input).clone(),
                Err(_) => {
                    return Box::pin(async move {
                        Err(ScopeError::TypeMismatch(label.to_string()))
                    });
                }
            };
            let fut = factory(ctx, input, deps);
            Box::pin(async move {
                match fut.await {
                    Ok(value) => Ok(Arc::new(value) as AnyValue),
                    Err(err) => Err(ScopeError::exec(label.to_string(), err)),
                }
            })
        });

        Flow {
            core: Arc::new(FlowCore {
                id,
                name,
                label,
                deps: self.deps,
                tags: self.tags,
            }),
            parse: self.parse,
            run,
            _marker: PhantomData,
        }
    }
}
