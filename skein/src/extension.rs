//! Extension pipeline: wrap atom resolution and exec calls with external
//! async logic (around pattern).
//!
//! Extensions are registered on the scope builder and composed in
//! declaration order, outer to inner: the first extension's wrapper runs
//! first and calls the second's, and so on down to the terminal step that
//! resolves dependencies and runs the factory. Extensions may time, trace,
//! enrich context data, or fail the wrapped operation by returning an error;
//! they can never replace the resolved value's atom.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::atom::AtomId;
use crate::context::ExecutionContext;
use crate::error::ScopeError;
use crate::scope::{Scope, ScopeId};
use crate::AnyValue;

/// The wrapped remainder of a resolution pipeline. Call it exactly once.
pub type ResolveNext =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<AnyValue, ScopeError>> + Send>;

/// The wrapped remainder of an exec pipeline. Call it exactly once.
pub type ExecNext = Box<dyn FnOnce() -> BoxFuture<'static, Result<AnyValue, ScopeError>> + Send>;

/// What is being resolved.
#[derive(Clone)]
pub struct ResolveEvent {
    /// The owning scope.
    pub scope: ScopeId,
    /// The atom being resolved.
    pub atom: AtomId,
    /// The atom's diagnostic label.
    pub label: Arc<str>,
}

impl fmt::Debug for ResolveEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveEvent")
            .field("scope", &self.scope)
            .field("atom", &self.atom)
            .field("label", &self.label)
            .finish()
    }
}

/// Whether an exec runs a flow or an ad-hoc function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    /// A flow descriptor.
    Flow,
    /// A function passed to `run`.
    Function,
}

/// What is being executed.
#[derive(Clone)]
pub struct ExecTarget {
    /// Flow or function.
    pub kind: ExecKind,
    /// The flow's name, or the exec-supplied function name.
    pub name: Option<Arc<str>>,
}

impl fmt::Debug for ExecTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecTarget")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

/// A pluggable cross-cutting concern registered at scope creation.
///
/// `init` runs before the scope reports ready; `dispose` runs during scope
/// disposal, in reverse declaration order.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Name for diagnostics.
    fn name(&self) -> &str;

    /// Awaited before the scope is ready; a failure fails every later
    /// `resolve` with it.
    async fn init(&self, scope: &Scope) -> Result<(), ScopeError> {
        let _ = scope;
        Ok(())
    }

    /// Awaited during scope disposal.
    async fn dispose(&self, scope: &Scope) -> Result<(), ScopeError> {
        let _ = scope;
        Ok(())
    }

    /// Wraps one atom resolution. Must call `next` to reach the factory.
    async fn wrap_resolve(
        &self,
        event: ResolveEvent,
        next: ResolveNext,
    ) -> Result<AnyValue, ScopeError> {
        let _ = event;
        next().await
    }

    /// Wraps one exec call. Must call `next` to reach the flow or function.
    async fn wrap_exec(
        &self,
        target: ExecTarget,
        ctx: ExecutionContext,
        next: ExecNext,
    ) -> Result<AnyValue, ScopeError> {
        let _ = (target, ctx);
        next().await
    }
}

pub(crate) fn compose_resolve(
    extensions: &[Arc<dyn Extension>],
    event: ResolveEvent,
    terminal: ResolveNext,
) -> ResolveNext {
    let mut next = terminal;
    for extension in extensions.iter().rev() {
        let extension = extension.clone();
        let event = event.clone();
        let inner = next;
        next = Box::new(move || {
            Box::pin(async move { extension.wrap_resolve(event, inner).await })
        });
    }
    next
}

pub(crate) fn compose_exec(
    extensions: &[Arc<dyn Extension>],
    target: ExecTarget,
    ctx: ExecutionContext,
    terminal: ExecNext,
) -> ExecNext {
    let mut next = terminal;
    for extension in extensions.iter().rev() {
        let extension = extension.clone();
        let target = target.clone();
        let ctx = ctx.clone();
        let inner = next;
        next = Box::new(move || {
            Box::pin(async move { extension.wrap_exec(target, ctx, inner).await })
        });
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Extension for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn wrap_resolve(
            &self,
            _event: ResolveEvent,
            next: ResolveNext,
        ) -> Result<AnyValue, ScopeError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:before", self.name));
            let out = next().await;
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            out
        }
    }

    /// **Scenario**: Declaration order composes outer to inner; the first
    /// extension sees next() resolve only after all inner ones complete.
    #[tokio::test]
    async fn declaration_order_is_outer_to_inner() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let extensions: Vec<Arc<dyn Extension>> = vec![
            Arc::new(Recorder {
                name: "outer",
                log: log.clone(),
            }),
            Arc::new(Recorder {
                name: "inner",
                log: log.clone(),
            }),
        ];
        let scope = Scope::new();
        let event = ResolveEvent {
            scope: scope.id(),
            atom: crate::atom::Atom::of("probe", 0u8).id(),
            label: Arc::from("probe"),
        };
        let log_terminal = log.clone();
        let terminal: ResolveNext = Box::new(move || {
            Box::pin(async move {
                log_terminal.lock().unwrap().push("factory".to_string());
                Ok(Arc::new(0u8) as AnyValue)
            })
        });

        let chain = compose_resolve(&extensions, event, terminal);
        chain().await.unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec![
                "outer:before",
                "inner:before",
                "factory",
                "inner:after",
                "outer:after"
            ]
        );
    }
}
