//! End-to-end scenarios for the sync client
//!
//! These tests drive the public API the way the dashboards do:
//! - Subscribing and request deduplication
//! - Optimistic mutation with reconciliation and rollback
//! - Out-of-order completions
//! - Grace-period retention and eviction
//! - Realtime echo suppression and invalidation
//! - Rollbacks, global clears and invalidations racing a running fetch

mod common;

use campaign_sync::cache::{Reconcile, WriteOutcome};
use campaign_sync::{
    CacheStore, ChangeKind, Descriptor, EntryStatus, RealtimeEvent, RealtimeOutcome,
    ResourceRoute, RevalidationPolicy, SyncClient, SyncConfig, SyncError,
};
use common::{append, settle, TestFetcher};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_test::{assert_pending, task};

fn client_with(fetcher: Arc<TestFetcher>, config: SyncConfig) -> SyncClient {
    SyncClient::new(config, fetcher).unwrap()
}

fn quiet_config() -> SyncConfig {
    SyncConfig::builder().enable_auto_cleanup(false).build()
}

fn active_campaigns() -> Descriptor {
    Descriptor::new("/campaigns").param("status", "active")
}

#[tokio::test]
async fn test_optimistic_append_then_reconcile() {
    let fetcher = Arc::new(TestFetcher::new(Duration::ZERO));
    fetcher.respond("/campaigns", json!([{"id": 1}]));
    let client = client_with(fetcher.clone(), quiet_config());

    let mut handle = client.use_entry(Some(&active_campaigns()));
    let view = handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();
    assert_eq!(view.data, Some(json!([{"id": 1}])));

    let key = handle.key().unwrap().clone();
    let (release, gate) = oneshot::channel::<()>();
    let take_server: Reconcile<Value> = Box::new(|server: &Value| server.clone());
    let mut pending = task::spawn(client.mutate(
        &key,
        append(json!({"id": 2})),
        move || async move {
            gate.await?;
            Ok::<_, anyhow::Error>(json!([{"id": 1}, {"id": 2}, {"id": 3}]))
        },
        Some(take_server),
    ));

    // Visible before the remote write settles
    assert_pending!(pending.poll());
    assert_eq!(handle.data(), Some(json!([{"id": 1}, {"id": 2}])));

    release.send(()).unwrap();
    let server = pending.await.unwrap();

    assert_eq!(server, json!([{"id": 1}, {"id": 2}, {"id": 3}]));
    assert_eq!(handle.data(), Some(json!([{"id": 1}, {"id": 2}, {"id": 3}])));
    assert_eq!(handle.view().status, EntryStatus::Success);
    assert_eq!(client.stats().mutations_confirmed, 1);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_failed_mutation_restores_previous_data() {
    let fetcher = Arc::new(TestFetcher::new(Duration::ZERO));
    fetcher.respond("/campaigns", json!([{"id": 1}]));
    let client = client_with(fetcher, quiet_config());

    let mut handle = client.use_entry(Some(&active_campaigns()));
    handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();
    let before = handle.view();
    let key = handle.key().unwrap().clone();

    let result = client
        .mutate(
            &key,
            append(json!({"id": 2})),
            || async { Err::<Value, _>(anyhow::anyhow!("422 Unprocessable Entity")) },
            None::<Reconcile<Value>>,
        )
        .await;

    match result {
        Err(SyncError::MutationError { key: failed, message }) => {
            assert_eq!(failed, key.to_string());
            assert!(message.contains("422"));
        }
        other => panic!("expected a mutation error, got {:?}", other),
    }
    assert_eq!(handle.view(), before);
}

/// Literal sequences for overlapping mutations, starting from `[1]`:
/// A appends 2, then B appends 3 before A settles.
#[tokio::test]
async fn test_overlapping_mutation_rollbacks() {
    // (A succeeds, B succeeds, settle A first, expected after first, expected after second)
    let cases = [
        (true, true, true, json!([1, 2, 3]), json!([1, 2, 3])),
        (true, false, false, json!([1, 2]), json!([1, 2])),
        (false, true, true, json!([1, 3]), json!([1, 3])),
        (false, false, true, json!([1, 3]), json!([1])),
    ];

    for (a_ok, b_ok, a_first, after_first, after_both) in cases {
        let store = CacheStore::new();
        let key = Descriptor::new("/campaigns").key().unwrap();
        let seq = store.begin_write();
        store.set(&key, |e| e.fetch_succeeded(json!([1]), seq, Instant::now()));
        let coordinator = Arc::new(campaign_sync::cache::MutationCoordinator::new(store.clone()));

        let (tx_a, rx_a) = oneshot::channel::<bool>();
        let (tx_b, rx_b) = oneshot::channel::<bool>();
        let write = |rx: oneshot::Receiver<bool>| {
            move || async move {
                match rx.await {
                    Ok(true) => Ok(()),
                    _ => Err(anyhow::anyhow!("rejected")),
                }
            }
        };

        let a = coordinator.mutate(&key, append(json!(2)), write(rx_a), None::<Reconcile<()>>);
        let b = coordinator.mutate(&key, append(json!(3)), write(rx_b), None::<Reconcile<()>>);
        assert_eq!(store.get(&key).unwrap().data, Some(json!([1, 2, 3])));

        let data = || store.get(&key).unwrap().data.unwrap();
        if a_first {
            tx_a.send(a_ok).unwrap();
            assert_eq!(a.await.is_ok(), a_ok);
            assert_eq!(data(), after_first);
            tx_b.send(b_ok).unwrap();
            assert_eq!(b.await.is_ok(), b_ok);
        } else {
            tx_b.send(b_ok).unwrap();
            assert_eq!(b.await.is_ok(), b_ok);
            assert_eq!(data(), after_first);
            tx_a.send(a_ok).unwrap();
            assert_eq!(a.await.is_ok(), a_ok);
        }
        assert_eq!(data(), after_both);
        assert_eq!(store.get(&key).unwrap().metadata.pending_mutations, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_subscribers_share_one_fetch() {
    let fetcher = Arc::new(TestFetcher::new(Duration::from_millis(50)));
    fetcher.respond("/campaigns", json!([{"id": 1}]));
    let client = client_with(fetcher.clone(), quiet_config());

    let mut handles: Vec<_> = (0..5)
        .map(|_| client.use_entry(Some(&active_campaigns())))
        .collect();

    for handle in &mut handles {
        let view = handle
            .wait_until(|v| v.status == EntryStatus::Success)
            .await
            .unwrap();
        assert_eq!(view.data, Some(json!([{"id": 1}])));
    }

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(client.subscriber_count(handles[0].key().unwrap()), 5);
    assert_eq!(client.stats().fetches_deduplicated, 4);
}

#[tokio::test]
async fn test_stale_completion_never_clobbers_newer_data() {
    let store = CacheStore::new();
    let key = Descriptor::new("/campaigns/42").key().unwrap();

    let t0 = store.begin_write();
    let t1 = store.begin_write();

    let landed = store.set_if_newer(&key, t1, |e| {
        e.fetch_succeeded(json!({"rev": 1}), t1, Instant::now())
    });
    assert_eq!(landed, WriteOutcome::Applied);

    let late = store.set_if_newer(&key, t0, |e| {
        e.fetch_succeeded(json!({"rev": 0}), t0, Instant::now())
    });
    assert_eq!(late, WriteOutcome::StaleIgnored);
    assert_eq!(store.get(&key).unwrap().data, Some(json!({"rev": 1})));
}

#[tokio::test(start_paused = true)]
async fn test_realtime_patch_beats_slower_fetch() {
    let fetcher = Arc::new(TestFetcher::new(Duration::from_millis(100)));
    fetcher.respond("/campaigns/42", json!({"id": 42, "status": "draft"}));
    let client = client_with(fetcher, quiet_config());
    client.register_route(ResourceRoute::new("campaign", "/campaigns/{id}"));

    let item = Descriptor::new("/campaigns/42");
    let mut handle = client.use_entry(Some(&item));
    handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();

    // A revalidation starts, then a newer pushed version lands first
    let fetch = handle.revalidate().unwrap();
    let event = RealtimeEvent::new("campaign", "42", ChangeKind::Updated)
        .with_actor("userB")
        .with_payload(json!({"id": 42, "status": "active"}));
    assert!(matches!(
        client.handle_event(&event),
        RealtimeOutcome::Patched { .. }
    ));

    fetch.await.unwrap();
    let view = handle.view();
    assert_eq!(view.data, Some(json!({"id": 42, "status": "active"})));
    assert!(!view.status.is_fetching());
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_retention_and_refetch() {
    let fetcher = Arc::new(TestFetcher::new(Duration::ZERO));
    fetcher.respond("/campaigns/42", json!({"id": 42}));
    let config = SyncConfig::builder()
        .grace_period(Duration::from_secs(30))
        .enable_auto_cleanup(false)
        .build();
    let client = client_with(fetcher.clone(), config);
    let item = Descriptor::new("/campaigns/42");
    let policy = RevalidationPolicy::builder().on_mount(false).build();

    let mut handle = client.use_entry_with(Some(&item), policy.clone());
    handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();
    drop(handle);

    // Within the grace period: cached data, no network call
    tokio::time::advance(Duration::from_secs(10)).await;
    let handle = client.use_entry_with(Some(&item), policy.clone());
    assert_eq!(handle.data(), Some(json!({"id": 42})));
    assert_eq!(handle.view().status, EntryStatus::Success);
    settle(|| false).await;
    assert_eq!(fetcher.calls(), 1);
    drop(handle);

    // After the grace period: a fresh fetch
    tokio::time::advance(Duration::from_secs(31)).await;
    let mut handle = client.use_entry_with(Some(&item), policy);
    assert_eq!(handle.view().status, EntryStatus::Loading);
    assert!(handle.data().is_none());
    handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_during_load_still_lands() {
    let fetcher = Arc::new(TestFetcher::new(Duration::from_millis(100)));
    fetcher.respond("/brands", json!(["acme"]));
    let client = client_with(fetcher, quiet_config());
    let brands = Descriptor::new("/brands");

    let handle = client.use_entry(Some(&brands));
    assert_eq!(handle.view().status, EntryStatus::Loading);
    drop(handle);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let entry = client.store().get(&brands.key().unwrap()).unwrap();
    assert_eq!(entry.status, EntryStatus::Success);
    assert_eq!(entry.data, Some(json!(["acme"])));
    assert_eq!(entry.metadata.subscriber_count, 0);
}

#[tokio::test]
async fn test_failed_revalidation_keeps_previous_render() {
    let fetcher = Arc::new(TestFetcher::new(Duration::ZERO));
    fetcher.respond("/campaigns", json!([{"id": 1}]));
    let client = client_with(fetcher.clone(), quiet_config());

    let mut handle = client.use_entry(Some(&active_campaigns()));
    handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();

    fetcher.enqueue("/campaigns", Err(anyhow::anyhow!("503 Service Unavailable")));
    assert_eq!(client.on_focus(), 1);
    let view = handle
        .wait_until(|v| v.status == EntryStatus::Error)
        .await
        .unwrap();

    assert_eq!(view.data, Some(json!([{"id": 1}])));
    assert!(matches!(view.error, Some(SyncError::FetchError { .. })));

    // Errors are not terminal
    assert_eq!(client.on_reconnect(), 1);
    let view = handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();
    assert!(view.error.is_none());
}

#[tokio::test]
async fn test_realtime_echo_and_foreign_change() {
    let fetcher = Arc::new(TestFetcher::new(Duration::ZERO));
    fetcher.respond("/campaigns/42", json!({"id": 42, "status": "draft"}));
    let config = SyncConfig::builder()
        .local_actor_id("userA")
        .enable_auto_cleanup(false)
        .build();
    let client = client_with(fetcher.clone(), config);
    client.register_route(
        ResourceRoute::new("campaign", "/campaigns/{id}").with_collection("/campaigns"),
    );

    let item = Descriptor::new("/campaigns/42");
    let mut handle = client.use_entry(Some(&item));
    handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();
    let before = client.store().get(&item.key().unwrap()).unwrap();

    let own = RealtimeEvent::new("campaign", "42", ChangeKind::StatusChanged).with_actor("userA");
    assert!(matches!(
        client.handle_event(&own),
        RealtimeOutcome::EchoSuppressed
    ));
    let after = client.store().get(&item.key().unwrap()).unwrap();
    assert_eq!(after.metadata.version, before.metadata.version);

    fetcher.respond("/campaigns/42", json!({"id": 42, "status": "active"}));
    let foreign =
        RealtimeEvent::new("campaign", "42", ChangeKind::StatusChanged).with_actor("userB");
    client.handle_event(&foreign);
    assert_eq!(handle.view().status, EntryStatus::Revalidating);
    assert_eq!(handle.data(), Some(json!({"id": 42, "status": "draft"})));

    let view = handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();
    assert_eq!(view.data, Some(json!({"id": 42, "status": "active"})));
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(client.stats().echoes_suppressed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_polling_subscription_stops_on_drop() {
    let fetcher = Arc::new(TestFetcher::new(Duration::ZERO));
    fetcher.respond("/notifications", json!([]));
    let client = client_with(fetcher.clone(), quiet_config());
    let policy = RevalidationPolicy::builder()
        .poll_interval(Duration::from_secs(5))
        .build();

    let mut handle = client.use_entry_with(Some(&Descriptor::new("/notifications")), policy);
    handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(fetcher.calls(), 3);

    drop(handle);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_running_at_clear_does_not_repopulate() {
    let fetcher = Arc::new(TestFetcher::new(Duration::from_millis(100)));
    fetcher.respond("/me", json!({"id": "userA"}));
    let client = client_with(fetcher.clone(), quiet_config());
    let me = Descriptor::new("/me");

    let handle = client.use_entry(Some(&me));
    assert_eq!(handle.view().status, EntryStatus::Loading);

    let event = client.clear_all();
    assert_eq!(event.keys, vec![me.key().unwrap()]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fetcher.calls(), 1);
    assert!(client.store().is_empty());
    assert_eq!(handle.view(), campaign_sync::EntryView::default());
    assert_eq!(client.stats().stale_writes_ignored, 1);
}

#[tokio::test]
async fn test_stats_track_engine_activity() {
    let fetcher = Arc::new(TestFetcher::new(Duration::ZERO));
    fetcher.respond("/brands", json!(["acme"]));
    let client = client_with(fetcher, quiet_config());
    let brands = Descriptor::new("/brands");
    let policy = RevalidationPolicy::builder()
        .dedupe_interval(Duration::from_secs(60))
        .build();

    let mut first = client.use_entry_with(Some(&brands), policy.clone());
    let second = client.use_entry_with(Some(&brands), policy);
    first
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();

    // Within the dedupe interval a focus event is throttled
    assert_eq!(client.on_focus(), 0);
    drop(second);

    let stats = client.stats();
    assert_eq!(stats.fetches_started, 1);
    assert_eq!(stats.fetches_deduplicated, 1);
    assert_eq!(stats.revalidations_skipped, 1);
    assert_eq!(stats.fetch_failures, 0);
    assert!((stats.dedup_ratio() - 50.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_rolled_back_mutation_lets_earlier_fetch_land() {
    let fetcher = Arc::new(TestFetcher::new(Duration::from_millis(100)));
    fetcher.respond("/drafts", json!(["v1"]));
    let client = client_with(fetcher.clone(), quiet_config());
    let drafts = Descriptor::new("/drafts");

    let mut handle = client.use_entry(Some(&drafts));
    handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();

    fetcher.respond("/drafts", json!(["v2"]));
    let fetch = handle.revalidate().unwrap();
    settle(|| fetcher.calls() == 2).await;

    let key = handle.key().unwrap().clone();
    let result = client
        .mutate(
            &key,
            append(json!("local")),
            || async { Err::<Value, _>(anyhow::anyhow!("500 Internal Server Error")) },
            None::<Reconcile<Value>>,
        )
        .await;
    assert!(result.is_err());
    assert_eq!(handle.data(), Some(json!(["v1"])));

    fetch.await.unwrap();
    assert_eq!(handle.data(), Some(json!(["v2"])));
    assert_eq!(handle.view().status, EntryStatus::Success);
    assert_eq!(client.stats().stale_writes_ignored, 0);
}

#[tokio::test(start_paused = true)]
async fn test_clear_all_keeps_mounted_entry_subscribed() {
    let fetcher = Arc::new(TestFetcher::new(Duration::ZERO));
    fetcher.respond("/me", json!({"id": "userA"}));
    let config = SyncConfig::builder()
        .grace_period(Duration::from_secs(30))
        .enable_auto_cleanup(false)
        .build();
    let client = client_with(fetcher.clone(), config);
    let me = Descriptor::new("/me");
    let key = me.key().unwrap();

    let mut handle = client.use_entry(Some(&me));
    handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();

    client.clear_all();
    fetcher.respond("/me", json!({"id": "userB"}));
    handle.revalidate().unwrap().await.unwrap();

    assert_eq!(client.subscriber_count(&key), 1);
    let entry = client.store().get(&key).unwrap();
    assert_eq!(entry.metadata.subscriber_count, 1);
    assert_eq!(handle.data(), Some(json!({"id": "userB"})));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(client.evict_idle().is_empty());
    assert_eq!(handle.data(), Some(json!({"id": "userB"})));
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_during_fetch_shows_new_server_state() {
    let fetcher = Arc::new(TestFetcher::new(Duration::from_millis(100)));
    fetcher.respond("/campaigns/42", json!({"id": 42, "status": "draft"}));
    let client = client_with(fetcher.clone(), quiet_config());
    let item = Descriptor::new("/campaigns/42");

    let mut handle = client.use_entry(Some(&item));
    handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
        .unwrap();

    // The request goes out before the server changes
    let running = handle.revalidate().unwrap();
    settle(|| fetcher.calls() == 2).await;
    fetcher.respond("/campaigns/42", json!({"id": 42, "status": "active"}));
    let event = client.invalidate(&item.key().unwrap());
    assert_eq!(event.keys.len(), 1);

    running.await.unwrap();
    let active = json!({"id": 42, "status": "active"});
    let view = handle
        .wait_until(|v| v.data.as_ref() == Some(&active))
        .await
        .unwrap();

    assert_eq!(view.status, EntryStatus::Success);
    assert_eq!(fetcher.calls(), 3);
    let entry = client.store().get(&item.key().unwrap()).unwrap();
    assert!(!entry.metadata.stale);
}
