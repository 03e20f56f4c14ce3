//! # Campaign Sync (campaign-sync)
//!
//! Client-side data synchronization for the campaign dashboards: a
//! key-addressed cache with request deduplication, stale-while-revalidate,
//! optimistic mutation and realtime invalidation.
//!
//! ## Features
//!
//! - One in-memory store shared by every consumer, injected explicitly
//! - Async-first design using tokio
//! - Uniform, named revalidation policies instead of per-call-site flags
//! - Out-of-order fetch completions never clobber newer data
//! - Failed mutations roll back without erasing other pending mutations
//! - Echo suppression for realtime events caused by the local user
//!
//! ## Subscribing
//!
//! ```no_run
//! use campaign_sync::{Descriptor, HttpFetcher, SyncClient, SyncConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fetcher = Arc::new(HttpFetcher::new("https://api.example.com/v1")?);
//!     let client = SyncClient::new(SyncConfig::from_env()?, fetcher)?;
//!
//!     let campaigns = Descriptor::new("/campaigns").param("status", "active");
//!     let mut handle = client.use_entry(Some(&campaigns));
//!
//!     if let Some(view) = handle.wait_until(|v| v.status.is_settled()).await {
//!         println!("Campaigns: {:?}", view.data);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Optimistic Mutation
//!
//! ```no_run
//! use campaign_sync::cache::Reconcile;
//! use campaign_sync::{Descriptor, HttpFetcher, SyncClient, SyncConfig};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fetcher = Arc::new(HttpFetcher::new("https://api.example.com/v1")?);
//!     let client = SyncClient::new(SyncConfig::default(), fetcher)?;
//!     let key = Descriptor::new("/campaigns")
//!         .key()
//!         .ok_or_else(|| anyhow::anyhow!("empty path"))?;
//!     let reconcile: Reconcile<Value> = Box::new(|server: &Value| server.clone());
//!
//!     let created = client
//!         .mutate(
//!             &key,
//!             |data| {
//!                 let mut items = data.and_then(|v| v.as_array().cloned()).unwrap_or_default();
//!                 items.push(json!({"name": "Spring launch"}));
//!                 Value::Array(items)
//!             },
//!             || async { Ok::<_, anyhow::Error>(json!([{"id": 1, "name": "Spring launch"}])) },
//!             Some(reconcile),
//!         )
//!         .await?;
//!
//!     println!("Server answered: {}", created);
//!     Ok(())
//! }
//! ```
//!
//! ## Realtime Events
//!
//! ```no_run
//! use campaign_sync::{HttpFetcher, ResourceRoute, SyncClient, SyncConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fetcher = Arc::new(HttpFetcher::new("https://api.example.com/v1")?);
//!     let config = SyncConfig::builder().local_actor_id("user-17").build();
//!     let client = SyncClient::new(config, fetcher)?;
//!
//!     client.register_route(
//!         ResourceRoute::new("campaign", "/campaigns/{id}").with_collection("/campaigns"),
//!     );
//!
//!     let outcome = client.handle_json(&json!({
//!         "resourceType": "campaign",
//!         "resourceId": 42,
//!         "changeKind": "statusChanged",
//!         "actorId": "user-9"
//!     }))?;
//!     println!("Affected: {:?}", outcome.affected_keys());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod fetcher;

// Re-export main types for convenience
pub use cache::{
    CacheKey, CacheStore, ChangeKind, Descriptor, EntryHandle, EntryStatus, EntryView,
    InvalidationEvent, InvalidationReason, RealtimeEvent, RealtimeOutcome, ResourceRoute,
    RevalidationPolicy, SyncClient, SyncConfig, SyncStats, Trigger,
};
pub use error::{Result, SyncError};
pub use fetcher::{normalize_response, HttpFetcher, ResourceFetcher};
