//! Scope lifecycle: graceful disposal, immediate disposal, garbage
//! collection with cascade and keep_alive, and select subscriptions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skein::{
    Atom, AtomStatus, BoxError, DisposeOptions, GcConfig, Scope, ScopeError, ScopeState,
};

/// **Scenario**: In-flight work finishes within the disposal grace period;
/// operations started after dispose reject with the disposing error.
#[tokio::test(start_paused = true)]
async fn graceful_disposal_lets_inflight_work_finish() {
    let slow = Atom::builder().label("slow").build(|_ctx| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, BoxError>("ready".to_string())
    });
    let other = Atom::of("other", 1u8);
    let scope = Scope::new();

    let resolving = {
        let scope = scope.clone();
        let slow = slow.clone();
        tokio::spawn(async move { scope.resolve(&slow).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    let disposing = {
        let scope = scope.clone();
        tokio::spawn(async move {
            scope
                .dispose(DisposeOptions::new().grace(Duration::from_millis(500)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    let err = scope.resolve(&other).await.unwrap_err();
    assert!(matches!(err, ScopeError::Disposing));

    let value = resolving.await.unwrap().unwrap();
    assert_eq!(*value, "ready");

    disposing.await.unwrap().unwrap();
    assert_eq!(scope.state(), ScopeState::Disposed);

    let err = scope.resolve(&other).await.unwrap_err();
    assert!(matches!(err, ScopeError::Disposed));
}

/// **Scenario**: After dispose with zero grace, every registered cleanup has
/// executed, across all resolved atoms, in reverse resolution order.
#[tokio::test]
async fn immediate_disposal_runs_all_cleanups() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let first = {
        let log = log.clone();
        Atom::builder().label("first").build(move |ctx| {
            let log = log.clone();
            async move {
                ctx.cleanup(move || async move {
                    log.lock().unwrap().push("first");
                    Ok(())
                });
                Ok::<_, BoxError>(1u8)
            }
        })
    };
    let second = {
        let log = log.clone();
        Atom::builder().label("second").build(move |ctx| {
            let log = log.clone();
            async move {
                ctx.cleanup(move || async move {
                    log.lock().unwrap().push("second");
                    Ok(())
                });
                Ok::<_, BoxError>(2u8)
            }
        })
    };
    let scope = Scope::new();
    scope.resolve(&first).await.unwrap();
    scope.resolve(&second).await.unwrap();

    scope.dispose(DisposeOptions::immediate()).await.unwrap();

    // Reverse resolution order: second resolved last, cleans up first.
    assert_eq!(log.lock().unwrap().clone(), vec!["second", "first"]);
}

/// **Scenario**: Releasing the last reference starts the grace timer; after
/// it fires, the atom's cleanups run and its unreferenced dependency is
/// released too.
#[tokio::test(start_paused = true)]
async fn gc_releases_after_grace_and_cascades() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let connection = {
        let log = log.clone();
        Atom::builder().label("connection").build(move |ctx| {
            let log = log.clone();
            async move {
                ctx.cleanup(move || async move {
                    log.lock().unwrap().push("connection");
                    Ok(())
                });
                Ok::<_, BoxError>("conn".to_string())
            }
        })
    };
    let repository = {
        let log = log.clone();
        Atom::builder()
            .label("repository")
            .dep(&connection)
            .build(move |ctx| {
                let log = log.clone();
                async move {
                    ctx.cleanup(move || async move {
                        log.lock().unwrap().push("repository");
                        Ok(())
                    });
                    Ok::<_, BoxError>("repo".to_string())
                }
            })
    };
    let scope = Scope::new();

    scope.acquire_ref(&repository).unwrap();
    scope.resolve(&repository).await.unwrap();
    scope.release_ref(&repository).unwrap();

    // Default grace is 3 seconds; step past it.
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert_eq!(scope.status(&repository), AtomStatus::Idle);
    assert_eq!(scope.status(&connection), AtomStatus::Idle);
    assert_eq!(
        log.lock().unwrap().clone(),
        vec!["repository", "connection"]
    );
}

/// **Scenario**: Re-acquiring within the grace period cancels the release.
#[tokio::test(start_paused = true)]
async fn reacquire_cancels_the_gc_timer() {
    let atom = Atom::of("session", 5u64);
    let scope = Scope::builder()
        .gc(GcConfig {
            enabled: true,
            grace: Duration::from_millis(200),
        })
        .build();

    scope.acquire_ref(&atom).unwrap();
    scope.resolve(&atom).await.unwrap();
    scope.release_ref(&atom).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    scope.acquire_ref(&atom).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(scope.status(&atom), AtomStatus::Resolved);
}

/// **Scenario**: A keep_alive atom survives a zero reference count until
/// disposal.
#[tokio::test(start_paused = true)]
async fn keep_alive_pins_the_atom() {
    let ran_cleanup = Arc::new(AtomicUsize::new(0));
    let pinned = {
        let ran_cleanup = ran_cleanup.clone();
        Atom::builder()
            .label("pinned")
            .keep_alive()
            .build(move |ctx| {
                let ran_cleanup = ran_cleanup.clone();
                async move {
                    ctx.cleanup(move || async move {
                        ran_cleanup.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    Ok::<_, BoxError>(0u8)
                }
            })
    };
    let scope = Scope::new();

    scope.acquire_ref(&pinned).unwrap();
    scope.resolve(&pinned).await.unwrap();
    scope.release_ref(&pinned).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(scope.status(&pinned), AtomStatus::Resolved);
    assert_eq!(ran_cleanup.load(Ordering::SeqCst), 0);

    scope.dispose(DisposeOptions::immediate()).await.unwrap();
    assert_eq!(ran_cleanup.load(Ordering::SeqCst), 1);
}

/// **Scenario**: GC disabled keeps zero-reference atoms for the scope's
/// lifetime.
#[tokio::test(start_paused = true)]
async fn disabled_gc_never_releases() {
    let atom = Atom::of("cache", 1u32);
    let scope = Scope::builder()
        .gc(GcConfig {
            enabled: false,
            grace: Duration::from_millis(10),
        })
        .build();

    scope.acquire_ref(&atom).unwrap();
    scope.resolve(&atom).await.unwrap();
    scope.release_ref(&atom).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(scope.status(&atom), AtomStatus::Resolved);
}

#[derive(Clone, Debug, PartialEq)]
struct Profile {
    name: String,
    age: u32,
}

/// **Scenario**: Select listeners fire only when the selected slice changes
/// under the equality function.
#[tokio::test]
async fn select_listeners_are_equality_gated() {
    let profile = Atom::of(
        "profile",
        Profile {
            name: "ada".to_string(),
            age: 36,
        },
    );
    let scope = Scope::new();
    scope.resolve(&profile).await.unwrap();

    let names = scope.select(&profile, |p: &Profile| p.name.clone());
    assert_eq!(names.get().as_deref(), Some("ada"));

    let notifications: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let subscription = names
        .subscribe({
            let notifications = notifications.clone();
            move |name| notifications.lock().unwrap().push(name.clone())
        })
        .unwrap();

    let controller = scope.controller(&profile);
    // Same name, different age: the selection is unchanged.
    controller
        .set(Profile {
            name: "ada".to_string(),
            age: 37,
        })
        .await
        .unwrap();
    // New name: listeners fire once.
    controller
        .set(Profile {
            name: "grace".to_string(),
            age: 37,
        })
        .await
        .unwrap();

    assert_eq!(notifications.lock().unwrap().clone(), vec!["grace"]);
    drop(subscription);

    controller
        .set(Profile {
            name: "edsger".to_string(),
            age: 90,
        })
        .await
        .unwrap();
    assert_eq!(notifications.lock().unwrap().len(), 1);
}

/// **Scenario**: A select handle holds a retention reference while
/// subscribed, so GC leaves the atom alone until the last unsubscribe.
#[tokio::test(start_paused = true)]
async fn select_subscription_retains_the_atom() {
    let atom = Atom::of("observed", 3u64);
    let scope = Scope::builder()
        .gc(GcConfig {
            enabled: true,
            grace: Duration::from_millis(100),
        })
        .build();
    scope.resolve(&atom).await.unwrap();

    // A pending release is cancelled by the subscription's retention ref.
    scope.acquire_ref(&atom).unwrap();
    scope.release_ref(&atom).unwrap();
    let handle = scope.select(&atom, |v: &u64| *v);
    let subscription = handle.subscribe(|_v| {}).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(scope.status(&atom), AtomStatus::Resolved);

    drop(subscription);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(scope.status(&atom), AtomStatus::Idle);
}
