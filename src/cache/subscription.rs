//! Per-key subscriber fan-out and reference counting
//!
//! Each subscription registers a store listener and retains the key in the
//! store, which owns the consumer counts and copies them onto every entry it
//! writes. A global clear drops entries but not counts, so a key that is
//! still mounted never looks idle. When the count drops to zero the store stamps
//! `idle_since`; entries idle for longer than the grace period are evicted,
//! either by the periodic sweep or lazily when the key is subscribed again.

use crate::cache::{
    config::SyncConfig,
    invalidation::{InvalidationEvent, InvalidationReason},
    key::CacheKey,
    store::{CacheStore, Listener, ListenerId},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Handle returned by [`SubscriptionHub::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionToken {
    pub id: Uuid,
    pub key: CacheKey,
}

/// Subscriber registry on top of the store's listeners
pub struct SubscriptionHub {
    store: CacheStore,
    grace_period: Duration,
    cleanup_interval: Duration,
    listeners: Mutex<HashMap<Uuid, (CacheKey, ListenerId)>>,
}

impl SubscriptionHub {
    /// Create a hub using the grace period and cleanup cadence of `config`
    pub fn new(store: CacheStore, config: &SyncConfig) -> Self {
        Self {
            store,
            grace_period: config.grace_period,
            cleanup_interval: config.cleanup_interval,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Register `callback` for every change of `key`.
    ///
    /// The callback receives the full entry and fires once right away with
    /// the current state. An entry that outlived its grace period is evicted
    /// first, so the new subscriber starts from an empty entry.
    pub fn subscribe(&self, key: &CacheKey, callback: Listener) -> SubscriptionToken {
        let expired = self
            .store
            .get(key)
            .map(|entry| entry.is_evictable(Instant::now(), self.grace_period))
            .unwrap_or(false);
        if expired {
            debug!("Evicting expired entry on resubscribe: {}", key);
            self.store.delete(key);
            self.store.record(|s| s.evictions += 1);
        }

        let listener = self.store.subscribe(key, callback);
        let id = Uuid::new_v4();
        self.listeners.lock().insert(id, (key.clone(), listener));

        self.store.retain(key);

        SubscriptionToken {
            id,
            key: key.clone(),
        }
    }

    /// Remove a subscription; returns false if it was already removed
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let Some((key, listener)) = self.listeners.lock().remove(&token.id) else {
            return false;
        };

        self.store.unsubscribe(&key, listener);
        self.store.release(&key);
        true
    }

    /// Number of active subscriptions for `key`
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.store.subscriber_count(key)
    }

    /// Number of active subscriptions across all keys
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether there are no active subscriptions
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Grace period before idle entries are evicted
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Evict every entry idle for longer than the grace period
    pub fn evict_idle(&self) -> InvalidationEvent {
        let evicted = self.store.evict_idle(self.grace_period);
        InvalidationEvent::new(InvalidationReason::GracePeriodElapsed, evicted)
    }
}

/// Background task evicting idle entries every `cleanup_interval`
pub async fn start_auto_cleanup(hub: Arc<SubscriptionHub>) {
    let interval = hub.cleanup_interval;

    info!("Starting automatic idle-entry cleanup (interval: {:?})", interval);

    loop {
        tokio::time::sleep(interval).await;

        let event = hub.evict_idle();
        if !event.is_empty() {
            debug!("Auto cleanup evicted {} entries", event.keys.len());
        }
    }
}
