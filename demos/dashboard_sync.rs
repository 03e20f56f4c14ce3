//! Dashboard Sync Demo
//!
//! Walks through a campaign dashboard session against an in-memory backend:
//! subscribing, optimistic creation, a realtime status change from another
//! user and the resulting statistics.
//!
//! Usage:
//!   cargo run --example dashboard_sync
//!
//! Environment variables:
//!   RUST_LOG                - log filter (default: campaign_sync=debug,info)
//!   CAMPAIGN_SYNC_ACTOR_ID  - local user id (default: user-17)

use campaign_sync::cache::Reconcile;
use campaign_sync::fetcher::from_fn;
use campaign_sync::{
    ChangeKind, Descriptor, EntryStatus, RealtimeEvent, ResourceRoute, SyncClient, SyncConfig,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("campaign_sync=debug,info")),
        )
        .init();

    info!("=== Campaign Dashboard Sync Demo ===");

    // In-memory backend standing in for the campaign API
    let campaigns = Arc::new(Mutex::new(vec![
        json!({"id": 1, "name": "Winter sale", "status": "active"}),
    ]));
    let backend = Arc::clone(&campaigns);
    let fetcher = Arc::new(from_fn(move |descriptor: &Descriptor| {
        let snapshot = match descriptor.path.as_str() {
            "/campaigns" => Ok(Value::Array(backend.lock().clone())),
            path => Err(anyhow::anyhow!("404 Not Found: {}", path)),
        };
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            snapshot
        }
    }));

    let mut config = SyncConfig::from_env()?;
    if config.local_actor_id.is_none() {
        config.local_actor_id = Some("user-17".to_string());
    }
    let client = SyncClient::new(config, fetcher)?;
    client.register_route(
        ResourceRoute::new("campaign", "/campaigns/{id}").with_collection("/campaigns"),
    );

    info!("\n--- Subscribe ---");
    let list = Descriptor::new("/campaigns").param("status", "active");
    let mut handle = client.use_entry(Some(&list));
    info!("Status on mount: {}", handle.view().status);

    if let Some(view) = handle.wait_until(|v| v.status.is_settled()).await {
        info!("Loaded: {}", view.data.unwrap_or(serde_json::Value::Null));
    }

    info!("\n--- Optimistic create ---");
    let key = list.key().ok_or_else(|| anyhow::anyhow!("empty descriptor"))?;
    let server = Arc::clone(&campaigns);
    let take_server_rows: Reconcile<Value> = Box::new(|rows: &Value| rows.clone());
    let pending = client.mutate(
        &key,
        |data| {
            let mut items = data.and_then(|v| v.as_array().cloned()).unwrap_or_default();
            items.push(json!({"name": "Spring launch", "status": "draft"}));
            Value::Array(items)
        },
        move || async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut rows = server.lock();
            rows.push(json!({"id": 2, "name": "Spring launch", "status": "draft"}));
            Ok::<_, anyhow::Error>(Value::Array(rows.clone()))
        },
        Some(take_server_rows),
    );
    info!("Shown before the write settles: {}", handle.data().unwrap_or(serde_json::Value::Null));

    match pending.await {
        Ok(rows) => info!("Server confirmed: {}", rows),
        Err(e) => info!("Write failed and was rolled back: {}", e),
    }

    info!("\n--- Realtime ---");
    let echo = RealtimeEvent::new("campaign", "2", ChangeKind::Created).with_actor("user-17");
    info!("Own event: {:?}", client.handle_event(&echo));

    campaigns.lock()[0]["status"] = json!("paused");
    let foreign =
        RealtimeEvent::new("campaign", "1", ChangeKind::StatusChanged).with_actor("user-9");
    let outcome = client.handle_event(&foreign);
    info!("Foreign event affected: {:?}", outcome.affected_keys());

    if let Some(view) = handle
        .wait_until(|v| v.status == EntryStatus::Success)
        .await
    {
        info!("After revalidation: {}", view.data.unwrap_or(serde_json::Value::Null));
    }

    info!("\n--- Focus ---");
    info!("Keys refetching on focus: {}", client.on_focus());

    drop(handle);
    info!("\n{}", client.stats());

    Ok(())
}
