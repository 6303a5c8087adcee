//! Tests for the realtime manager over the in-memory transport
//! Timers run on a paused tokio clock.

use parking_lot::Mutex;
use realtime_manager::core::{
    ChangeEvent, ChangeKind, Config, Handlers, RealtimeError, RealtimeManager, SubscriptionConfig,
    SubscriptionState,
};
use realtime_manager::infra::{HandshakeMode, MemoryTransport};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn cfg() -> Arc<Config> {
    Arc::new(
        Config::builder()
            .realtime_url("https://abc123.supabase.co")
            .api_key("anon-key-value")
            .build()
            .unwrap(),
    )
}

fn setup() -> (MemoryTransport, RealtimeManager) {
    let t = MemoryTransport::new();
    let m = RealtimeManager::new(cfg(), Arc::new(t.clone()));
    (t, m)
}

/// Let spawned tasks drain their queues
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync) {
    let n = Arc::new(AtomicUsize::new(0));
    let c = n.clone();
    (n, move |_: &ChangeEvent| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

// === Registry ===

#[tokio::test(start_paused = true)]
async fn test_subscribe_goes_live() {
    let (t, m) = setup();
    m.subscribe("orders", SubscriptionConfig::table("orders"), Handlers::new())
        .await
        .unwrap();
    assert!(m.is_subscription_active("orders"));
    assert_eq!(m.subscription_state("orders"), Some(SubscriptionState::Live));
    assert_eq!(m.active_subscriptions(), vec!["orders".to_string()]);
    assert_eq!(m.stats().active_subscriptions, 1);
    assert_eq!(t.topics(), vec!["realtime:public:orders"]);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_unknown_is_noop() {
    let (_t, m) = setup();
    m.subscribe("a", SubscriptionConfig::table("orders"), Handlers::new())
        .await
        .unwrap();
    let before = m.stats();
    assert!(!m.unsubscribe("never"));
    assert_eq!(m.stats().active_subscriptions, before.active_subscriptions);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_closes_channel_and_ledger() {
    let (t, m) = setup();
    m.subscribe("a", SubscriptionConfig::table("orders"), Handlers::new())
        .await
        .unwrap();
    m.add_optimistic_update("a", ChangeKind::Insert, json!({"id": "r1"}), None);
    assert!(m.unsubscribe("a"));
    assert!(!m.unsubscribe("a"));
    assert_eq!(t.channel_count(), 0);
    assert!(m.optimistic_updates("a").is_empty());
    assert_eq!(m.subscription_state("a"), None);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_filter_rejected() {
    let (t, m) = setup();
    let err = m
        .subscribe(
            "bad",
            SubscriptionConfig::table("orders").filter("user_id"),
            Handlers::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RealtimeError::InvalidFilter { .. }));
    assert_eq!(t.opened_total(), 0);
    assert_eq!(m.subscription_state("bad"), None);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_replaces_pending() {
    let (t, m) = setup();
    t.set_handshake(HandshakeMode::Silent);

    let (first_hits, first) = counter();
    let pending = tokio::spawn({
        let m = m.clone();
        async move {
            m.subscribe(
                "x",
                SubscriptionConfig::table("orders"),
                Handlers::new().on_insert(first),
            )
            .await
        }
    });
    settle().await;
    assert_eq!(t.channel_count(), 1);

    t.set_handshake(HandshakeMode::Ack);
    let (second_hits, second) = counter();
    m.subscribe(
        "x",
        SubscriptionConfig::table("orders").filter("user_id=eq.42"),
        Handlers::new().on_insert(second),
    )
    .await
    .unwrap();

    assert_eq!(
        pending.await.unwrap(),
        Err(RealtimeError::Superseded("x".into()))
    );
    assert_eq!(t.channel_count(), 1);
    assert_eq!(t.topics(), vec!["realtime:public:orders:user_id=eq.42"]);

    t.publish(&ChangeEvent::insert("orders", json!({"id": 1, "user_id": 42})));
    settle().await;
    assert_eq!(first_hits.load(Ordering::SeqCst), 0);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_live_replaces_channel() {
    let (t, m) = setup();
    m.subscribe("x", SubscriptionConfig::table("orders"), Handlers::new())
        .await
        .unwrap();
    m.add_optimistic_update("x", ChangeKind::Insert, json!({"id": 1}), None);
    m.subscribe("x", SubscriptionConfig::table("users"), Handlers::new())
        .await
        .unwrap();
    assert_eq!(t.topics(), vec!["realtime:public:users"]);
    assert!(m.optimistic_updates("x").is_empty());
    assert_eq!(m.active_subscriptions().len(), 1);
}

// === Dispatch ===

#[tokio::test(start_paused = true)]
async fn test_dispatch_by_kind() {
    let (t, m) = setup();
    let (ins, on_ins) = counter();
    let (del, on_del) = counter();
    m.subscribe(
        "orders",
        SubscriptionConfig::table("orders"),
        Handlers::new().on_insert(on_ins).on_delete(on_del),
    )
    .await
    .unwrap();

    t.publish(&ChangeEvent::insert("orders", json!({"id": 1})));
    t.publish(&ChangeEvent::update("orders", None, json!({"id": 1})));
    t.publish(&ChangeEvent::delete("orders", json!({"id": 1})));
    settle().await;

    assert_eq!(ins.load(Ordering::SeqCst), 1);
    assert_eq!(del.load(Ordering::SeqCst), 1);
    // every delivered event counts, handled or not
    assert_eq!(m.stats().total_messages, 3);
    assert!(m.stats().last_activity.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_handler_failure_isolated() {
    let (t, m) = setup();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::new(AtomicUsize::new(0));
    let (e, s) = (errors.clone(), seen.clone());
    m.subscribe(
        "orders",
        SubscriptionConfig::table("orders"),
        Handlers::new()
            .on_insert(move |ev| {
                s.fetch_add(1, Ordering::SeqCst);
                match ev.identity("id").and_then(|v| v.as_i64()) {
                    Some(1) => anyhow::bail!("rejected row 1"),
                    Some(2) => panic!("handler bug"),
                    _ => Ok(()),
                }
            })
            .on_error(move |err| e.lock().push(err.clone())),
    )
    .await
    .unwrap();

    for id in 1..=3 {
        t.publish(&ChangeEvent::insert("orders", json!({"id": id})));
    }
    settle().await;

    assert_eq!(seen.load(Ordering::SeqCst), 3);
    let errors = errors.lock();
    assert_eq!(errors.len(), 2);
    assert!(matches!(&errors[0], RealtimeError::Handler { message, .. } if message.contains("rejected")));
    assert!(matches!(&errors[1], RealtimeError::Handler { message, .. } if message.contains("handler bug")));
    assert_eq!(m.stats().errors, 2);
    assert!(m.is_subscription_active("orders"));
}

// === Optimistic ledger ===

#[tokio::test(start_paused = true)]
async fn test_orders_scenario() {
    let (t, m) = setup();
    m.subscribe(
        "orders",
        SubscriptionConfig::table("orders").filter("user_id=eq.42"),
        Handlers::new(),
    )
    .await
    .unwrap();
    let uid = m.add_optimistic_update(
        "orders",
        ChangeKind::Insert,
        json!({"id": "o1", "user_id": 42}),
        None,
    );

    t.publish(&ChangeEvent::insert("orders", json!({"id": "o9", "user_id": 7})));
    t.publish(&ChangeEvent::insert("orders", json!({"id": "o1", "user_id": 42})));
    tokio::time::sleep(Duration::from_secs(2)).await;

    let all = m.optimistic_updates("orders");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id.as_ref(), uid);
    assert!(all[0].confirmed);
    assert!(m.pending_optimistic_updates("orders").is_empty());
    assert_eq!(m.stats().total_messages, 1);

    // confirmed entries age out one optimistic timeout after confirmation
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(m.optimistic_updates("orders").len(), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(m.optimistic_updates("orders").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_matches_kind_and_identity() {
    let (t, m) = setup();
    m.subscribe("s", SubscriptionConfig::table("orders"), Handlers::new())
        .await
        .unwrap();
    m.add_optimistic_update("s", ChangeKind::Update, json!({"id": "r1"}), Some("u1"));

    t.publish(&ChangeEvent::update("orders", None, json!({"id": "r2"})));
    t.publish(&ChangeEvent::insert("orders", json!({"id": "r1"})));
    settle().await;
    assert_eq!(m.pending_optimistic_updates("s").len(), 1);

    t.publish(&ChangeEvent::update("orders", None, json!({"id": "r1"})));
    settle().await;
    assert!(m.pending_optimistic_updates("s").is_empty());
    assert!(m.optimistic_updates("s")[0].confirmed);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_custom_identity_field() {
    let (t, m) = setup();
    m.subscribe(
        "s",
        SubscriptionConfig::table("orders").identity_field("uuid"),
        Handlers::new(),
    )
    .await
    .unwrap();
    m.add_optimistic_update("s", ChangeKind::Delete, json!({"uuid": 7}), None);
    t.publish(&ChangeEvent::delete("orders", json!({"uuid": "7"})));
    settle().await;
    assert!(m.pending_optimistic_updates("s").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_update_added_before_subscribe_uses_identity_field() {
    let (t, m) = setup();
    let uid = m.add_optimistic_update("s", ChangeKind::Delete, json!({"uuid": 7}), None);
    m.subscribe(
        "s",
        SubscriptionConfig::table("orders").identity_field("uuid"),
        Handlers::new(),
    )
    .await
    .unwrap();
    assert_eq!(m.pending_optimistic_updates("s").len(), 1);

    t.publish(&ChangeEvent::delete("orders", json!({"uuid": "7"})));
    settle().await;
    assert!(m.pending_optimistic_updates("s").is_empty());
    let all = m.optimistic_updates("s");
    assert_eq!(all[0].id.as_ref(), uid);
    assert!(all[0].confirmed);
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_eviction() {
    let (_t, m) = setup();
    let expired = Arc::new(Mutex::new(Vec::new()));
    let e = expired.clone();
    m.subscribe(
        "s",
        SubscriptionConfig::table("orders"),
        Handlers::new().on_expired(move |u| e.lock().push(u.id.to_string())),
    )
    .await
    .unwrap();
    let uid = m.add_optimistic_update("s", ChangeKind::Insert, json!({"id": "r1"}), None);

    tokio::time::sleep(Duration::from_millis(9_900)).await;
    assert_eq!(m.pending_optimistic_updates("s").len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(m.pending_optimistic_updates("s").is_empty());
    assert!(m.optimistic_updates("s").is_empty());
    assert_eq!(*expired.lock(), vec![uid]);
}

#[tokio::test(start_paused = true)]
async fn test_manual_confirm_and_remove() {
    let (_t, m) = setup();
    // ledger does not require a registered subscription
    let a = m.add_optimistic_update("loose", ChangeKind::Insert, json!({"id": 1}), Some("a"));
    let b = m.add_optimistic_update("loose", ChangeKind::Insert, json!({"id": 2}), Some("b"));
    assert_eq!((a.as_str(), b.as_str()), ("a", "b"));

    assert!(m.confirm_optimistic_update("loose", "a"));
    assert!(!m.confirm_optimistic_update("loose", "zzz"));
    assert!(m.remove_optimistic_update("loose", "b"));
    assert!(!m.remove_optimistic_update("loose", "b"));

    let all = m.optimistic_updates("loose");
    assert_eq!(all.len(), 1);
    assert!(all[0].confirmed);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(m.optimistic_updates("loose").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_entries_age_out() {
    let (t, m) = setup();
    let expired = Arc::new(AtomicUsize::new(0));
    let e = expired.clone();
    m.subscribe(
        "s",
        SubscriptionConfig::table("orders"),
        Handlers::new().on_expired(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .await
    .unwrap();

    for i in 0..1000 {
        m.add_optimistic_update("s", ChangeKind::Insert, json!({"id": i}), None);
        t.publish(&ChangeEvent::insert("orders", json!({"id": i})));
    }
    settle().await;
    assert_eq!(m.optimistic_updates("s").len(), 1000);
    assert!(m.pending_optimistic_updates("s").is_empty());

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(m.optimistic_updates("s").is_empty());
    assert_eq!(expired.load(Ordering::SeqCst), 0);
    assert_eq!(m.health_check().subscriptions[0].pending_updates, 0);
}

#[tokio::test(start_paused = true)]
async fn test_generated_ids_unique() {
    let (_t, m) = setup();
    let a = m.add_optimistic_update("s", ChangeKind::Insert, json!({"id": 1}), None);
    let b = m.add_optimistic_update("s", ChangeKind::Insert, json!({"id": 2}), None);
    assert_ne!(a, b);
    assert_eq!(m.pending_optimistic_updates("s").len(), 2);
}

// === Health ===

#[tokio::test(start_paused = true)]
async fn test_health_check_goes_stale() {
    let (_t, m) = setup();
    m.subscribe("s", SubscriptionConfig::table("orders"), Handlers::new())
        .await
        .unwrap();
    m.add_optimistic_update("s", ChangeKind::Insert, json!({"id": 1}), None);

    let report = m.health_check();
    assert!(!report.stale);
    assert_eq!(report.subscriptions.len(), 1);
    assert_eq!(report.subscriptions[0].state, SubscriptionState::Live);
    assert_eq!(report.subscriptions[0].pending_updates, 1);

    tokio::time::sleep(Duration::from_secs(121)).await;
    let report = m.health_check();
    assert!(report.stale);
    assert!(report.idle >= Duration::from_secs(120));
    // pending entry was evicted meanwhile
    assert_eq!(report.subscriptions[0].pending_updates, 0);
}

// === Teardown ===

#[tokio::test(start_paused = true)]
async fn test_destroy_clears_everything() {
    let (t, m) = setup();
    for table in ["orders", "users", "projects"] {
        m.subscribe(table, SubscriptionConfig::table(table), Handlers::new())
            .await
            .unwrap();
    }
    m.add_optimistic_update("orders", ChangeKind::Insert, json!({"id": 1}), None);
    m.add_optimistic_update("users", ChangeKind::Update, json!({"id": 2}), None);
    assert_eq!(m.active_subscriptions().len(), 3);

    m.destroy();
    assert!(m.is_destroyed());
    assert!(m.active_subscriptions().is_empty());
    assert!(m.optimistic_updates("orders").is_empty());
    assert!(m.optimistic_updates("users").is_empty());
    assert_eq!(m.health_check().subscriptions.len(), 0);
    assert_eq!(t.channel_count(), 0);

    // nothing fires afterwards
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(m.stats().active_subscriptions, 0);
    assert_eq!(m.stats().errors, 0);

    m.destroy();
    assert_eq!(
        m.subscribe("late", SubscriptionConfig::table("orders"), Handlers::new())
            .await,
        Err(RealtimeError::Destroyed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_destroy_during_handshake() {
    let (t, m) = setup();
    t.set_handshake(HandshakeMode::Silent);
    let pending = tokio::spawn({
        let m = m.clone();
        async move {
            m.subscribe("x", SubscriptionConfig::table("orders"), Handlers::new())
                .await
        }
    });
    settle().await;
    m.destroy();
    assert_eq!(pending.await.unwrap(), Err(RealtimeError::Destroyed));
}
