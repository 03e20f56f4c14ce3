//! # Client-Side Resource Cache
//!
//! Key-addressed cache for remote resources with stale-while-revalidate
//! semantics, built to back "use resource" style consumers.
//!
//! ## Features
//!
//! - **Canonical Keys**: descriptors with the same path and params share an entry
//! - **Request Deduplication**: at most one fetch per key, shared by all callers
//! - **Stale-While-Revalidate**: cached data stays visible while it is refreshed
//! - **Per-Subscription Policies**: mount, focus, reconnect, polling, throttle, retries
//! - **Optimistic Mutations**: immediate local writes with per-mutation rollback
//! - **Realtime Bridge**: push events patch or invalidate the affected entries
//! - **Grace-Period Eviction**: unsubscribed entries linger, then get swept
//!
//! ## Architecture
//!
//! Everything reads and writes through one [`CacheStore`]:
//! - [`RevalidationController`] decides when to fetch and lands results
//! - [`MutationCoordinator`] applies, confirms and rolls back local writes
//! - [`SubscriptionHub`] counts consumers and evicts idle entries
//! - [`RealtimeBridge`] turns push events into patches and invalidations
//!
//! ## Example
//!
//! ```no_run
//! use campaign_sync::cache::{Descriptor, RevalidationPolicy, SyncClient, SyncConfig};
//! use campaign_sync::fetcher::HttpFetcher;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let fetcher = Arc::new(HttpFetcher::new("https://api.example.com/v1")?);
//! let client = SyncClient::new(SyncConfig::dashboard(), fetcher)?;
//!
//! let campaigns = Descriptor::new("/campaigns").param("status", "active");
//! let mut handle = client.use_entry_with(
//!     Some(&campaigns),
//!     RevalidationPolicy::polling(Duration::from_secs(30)),
//! );
//!
//! while handle.changed().await {
//!     let view = handle.view();
//!     println!("{}: {:?}", view.status, view.data);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dedup;
pub mod entry;
pub mod invalidation;
pub mod key;
pub mod mutation;
pub mod realtime;
pub mod revalidate;
pub mod store;
pub mod subscription;
pub mod types;

pub use client::{EntryHandle, SyncClient};
pub use config::{RevalidationPolicy, RevalidationPolicyBuilder, SyncConfig, SyncConfigBuilder};
pub use dedup::{RequestDeduplicator, SharedFetch};
pub use entry::{Entry, EntryMetadata, EntryStatus, EntryView};
pub use invalidation::{InvalidationEvent, InvalidationReason};
pub use key::{serialize, serialize_value, CacheKey, Descriptor};
pub use mutation::{MutationCoordinator, Reconcile, Updater};
pub use realtime::{ChangeKind, RealtimeBridge, RealtimeEvent, RealtimeOutcome, ResourceRoute};
pub use revalidate::{Decision, RevalidationController, Trigger};
pub use store::{CacheStore, Listener, ListenerId, WriteOutcome};
pub use subscription::{start_auto_cleanup, SubscriptionHub, SubscriptionToken};
pub use types::SyncStats;
