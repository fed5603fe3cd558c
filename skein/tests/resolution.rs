//! Resolution protocol: caching, coalescing, failure caching, cycles,
//! presets, and the extension pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use skein::{
    preset, Atom, AtomStatus, BoxError, EventFilter, ExecNext, ExecTarget, Extension,
    ExecutionContext, ResolveEvent, ResolveNext, Scope, ScopeError,
};

fn counted_atom(label: &str, calls: Arc<AtomicUsize>) -> Atom<Vec<u8>> {
    Atom::builder().label(label).build(move |_ctx| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(vec![1, 2, 3])
        }
    })
}

/// **Scenario**: Two sequential resolves return the identical reference and
/// the factory runs once.
#[tokio::test]
async fn sequential_resolves_share_one_value() {
    let calls = Arc::new(AtomicUsize::new(0));
    let atom = counted_atom("singleton", calls.clone());
    let scope = Scope::new();

    let first = scope.resolve(&atom).await.unwrap();
    let second = scope.resolve(&atom).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// **Scenario**: Concurrent resolves coalesce onto one factory invocation.
#[tokio::test(start_paused = true)]
async fn concurrent_resolves_coalesce() {
    let calls = Arc::new(AtomicUsize::new(0));
    let atom = {
        let calls = calls.clone();
        Atom::builder().label("slow").build(move |_ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, BoxError>(7u64)
            }
        })
    };
    let scope = Scope::new();

    let (first, second, third) = tokio::join!(
        scope.resolve(&atom),
        scope.resolve(&atom),
        scope.resolve(&atom)
    );

    assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    assert_eq!(*third.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// **Scenario**: A failing factory caches the failed state: the error is
/// re-thrown to later resolvers, `Resolved` listeners never fire, `Any`
/// listeners see the failure.
#[tokio::test]
async fn factory_failure_is_cached_and_observable() {
    let atom: Atom<u32> = Atom::builder()
        .label("broken")
        .build(|_ctx| async move { Err::<u32, BoxError>("backend offline".into()) });
    let scope = Scope::new();
    let controller = scope.controller(&atom);

    let resolved_fired = Arc::new(AtomicUsize::new(0));
    let failures_seen = Arc::new(Mutex::new(Vec::new()));
    let _on_resolved = controller
        .on(EventFilter::Resolved, {
            let resolved_fired = resolved_fired.clone();
            move |_event| {
                resolved_fired.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    let _on_any = controller
        .on(EventFilter::Any, {
            let failures_seen = failures_seen.clone();
            move |event| failures_seen.lock().unwrap().push(event.kind)
        })
        .unwrap();

    let err = scope.resolve(&atom).await.unwrap_err();
    assert!(matches!(err, ScopeError::Factory { .. }));
    assert!(err.to_string().contains("broken"));
    assert_eq!(scope.status(&atom), AtomStatus::Failed);
    assert!(controller.get().is_none());
    assert!(controller.error().is_some());

    // Cached: resolving again re-throws without a new factory run.
    let again = scope.resolve(&atom).await.unwrap_err();
    assert!(matches!(again, ScopeError::Factory { .. }));

    assert_eq!(resolved_fired.load(Ordering::SeqCst), 0);
    let kinds = failures_seen.lock().unwrap().clone();
    assert!(kinds.contains(&skein::AtomEventKind::Failed));
}

/// **Scenario**: A dependency cycle through factory code fails with the
/// chain spelled out.
#[tokio::test]
async fn dynamic_cycle_is_detected() {
    let a_slot: Arc<OnceLock<Atom<i64>>> = Arc::new(OnceLock::new());
    let b_slot: Arc<OnceLock<Atom<i64>>> = Arc::new(OnceLock::new());

    let a = {
        let b_slot = b_slot.clone();
        Atom::builder().label("a").build(move |ctx| {
            let b_slot = b_slot.clone();
            async move {
                let b = b_slot.get().cloned().ok_or("b missing")?;
                let v = ctx.resolve(&b).await?;
                Ok::<_, BoxError>(*v + 1)
            }
        })
    };
    let b = {
        let a_slot = a_slot.clone();
        Atom::builder().label("b").build(move |ctx| {
            let a_slot = a_slot.clone();
            async move {
                let a = a_slot.get().cloned().ok_or("a missing")?;
                let v = ctx.resolve(&a).await?;
                Ok::<_, BoxError>(*v + 1)
            }
        })
    };
    a_slot.set(a.clone()).ok();
    b_slot.set(b.clone()).ok();

    let scope = Scope::new();
    let err = scope.resolve(&a).await.unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("circular dependency"),
        "unexpected error: {}",
        message
    );
    assert!(message.contains("a -> b -> a"), "unexpected chain: {}", message);
}

/// **Scenario**: A preset replaces the factory output; the factory never
/// runs.
#[tokio::test]
async fn preset_bypasses_the_factory() {
    let calls = Arc::new(AtomicUsize::new(0));
    let atom = {
        let calls = calls.clone();
        Atom::builder().label("config").build(move |_ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(1u32)
            }
        })
    };
    let scope = Scope::builder().preset(preset(&atom, 42u32)).build();

    assert_eq!(*scope.resolve(&atom).await.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(scope.status(&atom), AtomStatus::Resolved);
}

/// **Scenario**: Asking for an atom that was never declared fails with the
/// undeclared-dependency error.
#[tokio::test]
async fn undeclared_dependency_is_rejected() {
    let base = Atom::of("base", 5u64);
    let sneaky = {
        let base = base.clone();
        Atom::builder().label("sneaky").build(move |ctx| {
            let base = base.clone();
            async move {
                let v = ctx.get(&base)?;
                Ok::<_, BoxError>(*v)
            }
        })
    };
    let scope = Scope::new();
    let err = scope.resolve(&sneaky).await.unwrap_err();
    assert!(err.to_string().contains("not a declared dependency"));
}

struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Extension for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn init(&self, _scope: &Scope) -> Result<(), ScopeError> {
        self.log.lock().unwrap().push(format!("init:{}", self.name));
        Ok(())
    }

    async fn dispose(&self, _scope: &Scope) -> Result<(), ScopeError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("dispose:{}", self.name));
        Ok(())
    }

    async fn wrap_resolve(
        &self,
        event: ResolveEvent,
        next: ResolveNext,
    ) -> Result<skein::AnyValue, ScopeError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("resolve:{}:{}", self.name, event.label));
        next().await
    }

    async fn wrap_exec(
        &self,
        target: ExecTarget,
        _ctx: ExecutionContext,
        next: ExecNext,
    ) -> Result<skein::AnyValue, ScopeError> {
        let name = target.name.as_deref().unwrap_or("?").to_string();
        self.log
            .lock()
            .unwrap()
            .push(format!("exec:{}:{}", self.name, name));
        next().await
    }
}

/// **Scenario**: Extensions init before ready, wrap resolution outer to
/// inner in declaration order, and dispose in reverse order.
#[tokio::test]
async fn extension_pipeline_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let scope = Scope::builder()
        .extension(Arc::new(Recorder {
            name: "outer",
            log: log.clone(),
        }))
        .extension(Arc::new(Recorder {
            name: "inner",
            log: log.clone(),
        }))
        .build();
    scope.ready().await.unwrap();

    let atom = Atom::of("probe", 9u8);
    scope.resolve(&atom).await.unwrap();
    scope.dispose(skein::DisposeOptions::immediate()).await.unwrap();

    let entries = log.lock().unwrap().clone();
    assert_eq!(
        entries,
        vec![
            "init:outer",
            "init:inner",
            "resolve:outer:probe",
            "resolve:inner:probe",
            "dispose:inner",
            "dispose:outer",
        ]
    );
}

/// **Scenario**: An extension init failure surfaces through ready() and
/// fails every resolve.
#[tokio::test]
async fn extension_init_failure_poisons_the_scope() {
    struct FailingInit;

    #[async_trait]
    impl Extension for FailingInit {
        fn name(&self) -> &str {
            "failing-init"
        }

        async fn init(&self, _scope: &Scope) -> Result<(), ScopeError> {
            Err(ScopeError::factory("failing-init", "missing credentials"))
        }
    }

    let scope = Scope::builder().extension(Arc::new(FailingInit)).build();
    assert!(scope.ready().await.is_err());

    let atom = Atom::of("anything", 0u8);
    assert!(scope.resolve(&atom).await.is_err());
}
