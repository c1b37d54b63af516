//! End-to-end rotation scenarios against in-process signing clients.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use keyward_identity::testing::{
    self_signed_pair, ApprovalPolicy, FixedRandom, LocalAuthority, ManualClock,
    ScriptedSigningClient,
};
use keyward_identity::{
    resolve_initial, CsrTemplate, FileStore, IdentityStore, JitterPolicy, MemoryStore,
    RotationEvent, RotationManager, RotationStage, SystemClock,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

async fn next_matching<F>(events: &mut broadcast::Receiver<RotationEvent>, mut f: F) -> RotationEvent
where
    F: FnMut(&RotationEvent) -> bool,
{
    loop {
        match events.recv().await {
            Ok(event) if f(&event) => return event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
        }
    }
}

#[tokio::test]
async fn test_first_boot_rotates_on_start() {
    let clock = Arc::new(ManualClock::new(t0()));
    let authority = Arc::new(LocalAuthority::new(clock.clone()).unwrap());
    let store = Arc::new(MemoryStore::new());
    let manager = RotationManager::builder(store.clone())
        .template(CsrTemplate::new("system:node:worker-1").with_organization("system:nodes"))
        .clock(clock)
        .signing_client(authority.clone())
        .build()
        .await
        .unwrap();

    assert!(manager.current().is_none());
    let handle = manager.start().await.unwrap();

    let identity = manager.current().expect("rotated on start");
    assert!(identity
        .leaf()
        .subject()
        .unwrap()
        .contains("system:node:worker-1"));
    assert_eq!(store.update_count(), 1);
    assert_eq!(authority.created(), 1);
    assert_eq!(authority.released(), 1);
    assert!(!manager.should_rotate());

    manager.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_identity_is_served_then_replaced() {
    let clock = Arc::new(ManualClock::new(t0()));
    let (cert, key) = self_signed_pair("bootstrap", t0(), t0() + ChronoDuration::days(1));
    let authority = Arc::new(LocalAuthority::new(clock.clone()).unwrap());
    let manager = RotationManager::builder(Arc::new(MemoryStore::new()))
        .template(CsrTemplate::new("rotated"))
        .bootstrap(cert, key)
        .clock(clock)
        .signing_client(authority)
        .build()
        .await
        .unwrap();

    let bootstrap = manager.current().unwrap();
    assert!(bootstrap.leaf().subject().unwrap().contains("bootstrap"));
    assert!(manager.should_rotate(), "bootstrap forces rotation");

    let handle = manager.start().await.unwrap();
    let rotated = manager.current().unwrap();
    assert!(rotated.leaf().subject().unwrap().contains("rotated"));
    assert!(!manager.should_rotate());

    manager.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_denial_leaves_identity_unchanged() {
    let clock = Arc::new(ManualClock::new(t0()));
    let (cert, key) = self_signed_pair("stored", t0(), t0() + ChronoDuration::hours(1));
    let authority = Arc::new(LocalAuthority::new(clock.clone()).unwrap());
    authority.set_policy(ApprovalPolicy::Deny {
        reason: "PolicyViolation".into(),
        message: "node is cordoned".into(),
    });
    let store = Arc::new(MemoryStore::with_pair(cert, key));
    let manager = RotationManager::builder(store.clone())
        .clock(clock)
        .signing_client(authority.clone())
        .build()
        .await
        .unwrap();
    let mut events = manager.subscribe();

    let before = manager.current().unwrap();
    manager.force_rotation();
    assert!(!manager.rotate().await);

    let after = manager.current().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(*before, *after);
    assert!(manager.should_rotate(), "force flag survives a failed attempt");
    assert_eq!(store.update_count(), 0);
    assert_eq!(authority.released(), 1);

    match events.recv().await.unwrap() {
        RotationEvent::AttemptFailed { stage, error } => {
            assert_eq!(stage, RotationStage::RequestCertificate);
            assert!(error.contains("reason: PolicyViolation"));
            assert!(error.contains("message: node is cordoned"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_closed_watch_keeps_retrying_past_backoff() {
    let client = Arc::new(ScriptedSigningClient::new(|_| Vec::new()));
    let manager = RotationManager::builder(Arc::new(MemoryStore::new()))
        .random(Arc::new(FixedRandom::new(0.0)))
        .signing_client(client.clone())
        .build()
        .await
        .unwrap();
    let mut events = manager.subscribe();

    let handle = manager.start().await.unwrap();
    assert_eq!(client.created(), 1, "inline attempt at start");

    let exhausted = next_matching(&mut events, |e| {
        matches!(e, RotationEvent::BackoffExhausted { .. })
    })
    .await;
    assert_eq!(exhausted, RotationEvent::BackoffExhausted { attempts: 7 });
    assert_eq!(client.created(), 8);
    assert_eq!(manager.stats().backoff_exhausted(), 1);

    let started = tokio::time::Instant::now();
    next_matching(&mut events, |e| matches!(e, RotationEvent::AttemptFailed { .. })).await;
    assert!(started.elapsed() >= Duration::from_secs(128));
    assert_eq!(client.created(), 9);

    assert!(manager.current().is_none());
    assert_eq!(client.released(), client.opened());

    manager.shutdown();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pending_request_times_out() {
    let authority = Arc::new(LocalAuthority::new(Arc::new(SystemClock)).unwrap());
    authority.set_policy(ApprovalPolicy::Pending);
    let manager = RotationManager::builder(Arc::new(MemoryStore::new()))
        .watch_timeout(Duration::from_secs(30))
        .signing_client(authority.clone())
        .build()
        .await
        .unwrap();
    let mut events = manager.subscribe();

    assert!(!manager.rotate().await);
    match events.recv().await.unwrap() {
        RotationEvent::AttemptFailed { stage, error } => {
            assert_eq!(stage, RotationStage::RequestCertificate);
            assert!(error.contains("timed out"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(authority.released(), 1);
}

#[test]
fn test_concurrent_readers_never_see_none() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (cert, key) = {
        let now = Utc::now();
        self_signed_pair("bootstrap", now, now + ChronoDuration::hours(1))
    };
    let authority = Arc::new(LocalAuthority::new(Arc::new(SystemClock)).unwrap());
    let manager = runtime
        .block_on(
            RotationManager::builder(Arc::new(MemoryStore::new()))
                .bootstrap(cert, key)
                .signing_client(authority)
                .build(),
        )
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let misses = Arc::new(AtomicUsize::new(0));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            let stop = stop.clone();
            let misses = misses.clone();
            std::thread::spawn(move || {
                let mut seen = HashSet::new();
                while !stop.load(Ordering::SeqCst) {
                    match manager.current() {
                        Some(identity) => {
                            seen.insert(identity.leaf().der().to_vec());
                        }
                        None => {
                            misses.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                seen.len()
            })
        })
        .collect();

    runtime.block_on(async {
        for _ in 0..5 {
            assert!(manager.rotate().await);
        }
    });
    stop.store(true, Ordering::SeqCst);

    for reader in readers {
        assert!(reader.join().unwrap() >= 1);
    }
    assert_eq!(misses.load(Ordering::SeqCst), 0);
    assert_eq!(manager.stats().successes(), 5);
}

#[tokio::test]
async fn test_resolving_twice_without_bootstrap() {
    let store = MemoryStore::new();
    for _ in 0..2 {
        let initial = resolve_initial(&store, None).await.unwrap();
        assert!(initial.identity.is_none());
        assert!(initial.force_rotation);
    }
}

#[tokio::test]
async fn test_fixed_jitter_deadline() {
    let clock = Arc::new(ManualClock::new(t0()));
    let (cert, key) = self_signed_pair("stored", t0(), t0() + ChronoDuration::seconds(100));
    let authority = Arc::new(LocalAuthority::new(clock.clone()).unwrap());
    let manager = RotationManager::builder(Arc::new(MemoryStore::with_pair(cert, key)))
        .clock(clock.clone())
        .jitter(JitterPolicy::fixed(0.8))
        .signing_client(authority.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(
        manager.rotation_deadline(),
        t0() + ChronoDuration::seconds(80)
    );

    clock.set(t0() + ChronoDuration::seconds(79));
    assert!(!manager.should_rotate());

    clock.set(t0() + ChronoDuration::seconds(81));
    assert!(manager.should_rotate());

    let handle = manager.start().await.unwrap();
    assert_eq!(authority.created(), 1);
    let rotated = manager.current().unwrap();
    assert_eq!(rotated.not_before(), t0() + ChronoDuration::seconds(81));
    assert_eq!(
        manager.rotation_deadline(),
        rotated.not_before() + ChronoDuration::seconds(2880)
    );

    manager.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_force_rotation_wakes_running_loop() {
    let now = Utc::now();
    let (cert, key) = self_signed_pair("stored", now, now + ChronoDuration::hours(1));
    let authority = Arc::new(LocalAuthority::new(Arc::new(SystemClock)).unwrap());
    let manager = RotationManager::builder(Arc::new(MemoryStore::with_pair(cert, key)))
        .signing_client(authority.clone())
        .build()
        .await
        .unwrap();
    let mut events = manager.subscribe();

    let handle = manager.start().await.unwrap();
    assert_eq!(authority.created(), 0, "nothing due at start");

    manager.force_rotation();
    let event = tokio::time::timeout(
        Duration::from_secs(10),
        next_matching(&mut events, |e| matches!(e, RotationEvent::Rotated { .. })),
    )
    .await
    .expect("loop rotated after force");
    assert!(matches!(event, RotationEvent::Rotated { .. }));
    assert_eq!(authority.created(), 1);

    manager.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let authority = Arc::new(LocalAuthority::new(clock.clone()).unwrap());

    let manager = RotationManager::builder(Arc::new(FileStore::new(dir.path(), "agent")))
        .clock(clock.clone())
        .signing_client(authority)
        .build()
        .await
        .unwrap();
    let handle = manager.start().await.unwrap();
    let rotated = manager.current().unwrap();
    manager.shutdown();
    handle.await.unwrap();

    let reopened = FileStore::new(dir.path(), "agent");
    assert_eq!(reopened.current().await.unwrap(), *rotated);

    let restarted = RotationManager::builder(Arc::new(reopened))
        .clock(clock)
        .build()
        .await
        .unwrap();
    assert_eq!(*restarted.current().unwrap(), *rotated);
    assert!(!restarted.should_rotate());
}
