//! Reactive updates: set/update cascades, cleanup ordering, deferred
//! self-invalidation, and invalidation loop detection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use skein::{Atom, BoxError, Scope};

/// **Scenario**: A reactive chain re-resolves the dependent after a set:
/// counter 0 → doubled 0, set 3, flush, doubled 6.
#[tokio::test]
async fn set_propagates_through_reactive_dep() {
    let counter = Atom::of("counter", 0i64);
    let doubled = {
        let counter_handle = counter.clone();
        Atom::builder()
            .label("doubled")
            .dep(&counter)
            .build(move |ctx| {
                let counter = counter_handle.clone();
                async move { Ok::<_, BoxError>(*ctx.get(&counter)? * 2) }
            })
    };
    let scope = Scope::new();

    assert_eq!(*scope.resolve(&doubled).await.unwrap(), 0);

    scope.controller(&counter).set(3).await.unwrap();
    scope.flush().await.unwrap();

    assert_eq!(*scope.resolve(&doubled).await.unwrap(), 6);
    assert_eq!(*scope.resolve(&counter).await.unwrap(), 3);
}

/// **Scenario**: update() installs f(current) based on the snapshot.
#[tokio::test]
async fn update_uses_the_current_snapshot() {
    let counter = Atom::of("counter", 10i64);
    let scope = Scope::new();
    scope.resolve(&counter).await.unwrap();

    let controller = scope.controller(&counter);
    controller
        .update(|current| current.map(|v| *v).unwrap_or(0) + 5)
        .await
        .unwrap();

    assert_eq!(*scope.resolve(&counter).await.unwrap(), 15);
}

/// **Scenario**: Cleanups registered in order c1, c2 run as c2, c1 on
/// invalidation, before the new value becomes visible.
#[tokio::test]
async fn cleanups_run_lifo_before_reresolution() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let atom = {
        let log = log.clone();
        Atom::builder().label("resource").build(move |ctx| {
            let log = log.clone();
            async move {
                {
                    let log = log.clone();
                    ctx.cleanup(move || async move {
                        log.lock().unwrap().push("a");
                        Ok(())
                    });
                }
                {
                    let log = log.clone();
                    ctx.cleanup(move || async move {
                        log.lock().unwrap().push("b");
                        Ok(())
                    });
                }
                log.lock().unwrap().push("factory");
                Ok::<_, BoxError>("v1".to_string())
            }
        })
    };
    let scope = Scope::new();
    scope.resolve(&atom).await.unwrap();

    scope.controller(&atom).invalidate().unwrap();
    scope.flush().await.unwrap();

    let entries = log.lock().unwrap().clone();
    assert_eq!(entries, vec!["factory", "b", "a", "factory"]);
}

/// **Scenario**: A factory invalidating itself defers until it returns,
/// then re-runs once the queue drains.
#[tokio::test]
async fn self_invalidation_is_deferred() {
    let runs = Arc::new(AtomicUsize::new(0));
    let atom = {
        let runs = runs.clone();
        Atom::builder().label("refresher").build(move |ctx| {
            let runs = runs.clone();
            async move {
                let run = runs.fetch_add(1, Ordering::SeqCst);
                if run == 0 {
                    // First run schedules its own refresh.
                    ctx.invalidate();
                }
                Ok::<_, BoxError>(run)
            }
        })
    };
    let scope = Scope::new();

    let first = scope.resolve(&atom).await.unwrap();
    assert_eq!(*first, 0);

    scope.flush().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(*scope.resolve(&atom).await.unwrap(), 1);
}

/// **Scenario**: Mutually reactive atoms trip the invalidation loop
/// detector on set, with the chain spelled out.
#[tokio::test]
async fn invalidation_loop_is_detected() {
    let a_slot: Arc<OnceLock<Atom<i64>>> = Arc::new(OnceLock::new());
    let b_slot: Arc<OnceLock<Atom<i64>>> = Arc::new(OnceLock::new());

    let a = {
        let b_slot = b_slot.clone();
        Atom::builder().label("a").build(move |ctx| {
            let b_slot = b_slot.clone();
            async move {
                let watched = b_slot
                    .get()
                    .and_then(|b| ctx.watch(b))
                    .map(|v| *v)
                    .unwrap_or(0);
                Ok::<_, BoxError>(watched + 1)
            }
        })
    };
    let b = {
        let a_slot = a_slot.clone();
        Atom::builder().label("b").build(move |ctx| {
            let a_slot = a_slot.clone();
            async move {
                let watched = a_slot
                    .get()
                    .and_then(|a| ctx.watch(a))
                    .map(|v| *v)
                    .unwrap_or(0);
                Ok::<_, BoxError>(watched + 1)
            }
        })
    };
    a_slot.set(a.clone()).ok();
    b_slot.set(b.clone()).ok();

    let scope = Scope::new();
    scope.resolve(&a).await.unwrap();
    scope.resolve(&b).await.unwrap();

    let err = scope.controller(&a).set(10).await.unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("invalidation loop"),
        "unexpected error: {}",
        message
    );
    assert!(message.contains("a -> b -> a"), "unexpected chain: {}", message);
}

/// **Scenario**: set() notifies Resolved and Any listeners synchronously in
/// registration order.
#[tokio::test]
async fn set_notifies_listeners_in_registration_order() {
    let atom = Atom::of("value", 1u32);
    let scope = Scope::new();
    scope.resolve(&atom).await.unwrap();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let controller = scope.controller(&atom);
    let _first = controller
        .on(skein::EventFilter::Resolved, {
            let order = order.clone();
            move |_event| order.lock().unwrap().push("first")
        })
        .unwrap();
    let _second = controller
        .on(skein::EventFilter::Any, {
            let order = order.clone();
            move |_event| order.lock().unwrap().push("second")
        })
        .unwrap();

    controller.set(2).await.unwrap();
    assert_eq!(order.lock().unwrap().clone(), vec!["first", "second"]);
}

/// **Scenario**: A dropped subscription stops receiving transitions.
#[tokio::test]
async fn dropped_subscription_is_unregistered() {
    let atom = Atom::of("value", 1u32);
    let scope = Scope::new();
    scope.resolve(&atom).await.unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let controller = scope.controller(&atom);
    let subscription = controller
        .on(skein::EventFilter::Any, {
            let fired = fired.clone();
            move |_event| {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    controller.set(2).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    subscription.unsubscribe();
    controller.set(3).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
