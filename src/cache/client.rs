//! Consumer-facing API
//!
//! [`SyncClient`] wires the store, deduplicator, revalidation controller,
//! mutation coordinator, subscription hub and realtime bridge together and
//! exposes the operations views are allowed to call: `use_entry`, `mutate`,
//! `invalidate` and `clear_all`, plus the host signals (focus, reconnect,
//! realtime events).

use crate::cache::{
    config::{RevalidationPolicy, SyncConfig},
    dedup::SharedFetch,
    entry::{Entry, EntryView},
    invalidation::{InvalidationEvent, InvalidationReason},
    key::{CacheKey, Descriptor},
    mutation::{MutationCoordinator, Reconcile},
    realtime::{RealtimeBridge, RealtimeEvent, RealtimeOutcome, ResourceRoute},
    revalidate::{RevalidationController, Trigger},
    store::CacheStore,
    subscription::{start_auto_cleanup, SubscriptionHub, SubscriptionToken},
    types::SyncStats,
};
use crate::error::Result;
use crate::fetcher::ResourceFetcher;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handle to the synchronization engine; clones share the same cache
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: SyncConfig,
    store: CacheStore,
    mutations: Arc<MutationCoordinator>,
    controller: Arc<RevalidationController>,
    hub: Arc<SubscriptionHub>,
    realtime: RealtimeBridge,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup.lock().take() {
            task.abort();
        }
    }
}

impl SyncClient {
    /// Build a client around `fetcher`.
    ///
    /// When auto cleanup is enabled and a tokio runtime is running, an
    /// eviction task is spawned; it stops when the last clone is dropped.
    pub fn new(config: SyncConfig, fetcher: Arc<dyn ResourceFetcher>) -> Result<Self> {
        config.validate()?;

        let store = CacheStore::with_metrics(config.enable_metrics);
        let mutations = Arc::new(MutationCoordinator::new(store.clone()));
        let controller = Arc::new(RevalidationController::new(
            store.clone(),
            Arc::clone(&mutations),
            fetcher,
        ));
        let hub = Arc::new(SubscriptionHub::new(store.clone(), &config));
        let realtime = RealtimeBridge::new(
            store.clone(),
            Arc::clone(&controller),
            config.local_actor_id.clone(),
        );

        let cleanup = if config.enable_auto_cleanup {
            tokio::runtime::Handle::try_current()
                .ok()
                .map(|runtime| runtime.spawn(start_auto_cleanup(Arc::clone(&hub))))
        } else {
            None
        };

        info!(
            "Sync client ready (grace period: {:?}, auto cleanup: {})",
            config.grace_period,
            cleanup.is_some()
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                store,
                mutations,
                controller,
                hub,
                realtime,
                cleanup: Mutex::new(cleanup),
            }),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The underlying store
    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    /// Subscribe to a resource with the default policy.
    ///
    /// `None` yields a disabled handle that never fetches.
    pub fn use_entry(&self, descriptor: Option<&Descriptor>) -> EntryHandle {
        self.use_entry_with(descriptor, self.inner.config.default_policy.clone())
    }

    /// Subscribe to a resource with an explicit revalidation policy
    pub fn use_entry_with(
        &self,
        descriptor: Option<&Descriptor>,
        policy: RevalidationPolicy,
    ) -> EntryHandle {
        let Some((descriptor, key)) = descriptor.and_then(|d| d.key().map(|k| (d.clone(), k)))
        else {
            debug!("Disabled subscription, nothing to fetch");
            let (_, receiver) = watch::channel(EntryView::default());
            return EntryHandle {
                key: None,
                receiver,
                subscription: None,
            };
        };

        let initial = self
            .inner
            .store
            .get(&key)
            .map(|entry| entry.view())
            .unwrap_or_default();
        let (sender, receiver) = watch::channel(initial);

        let token = self.inner.hub.subscribe(
            &key,
            Arc::new(move |entry: &Entry| {
                let view = entry.view();
                sender.send_if_modified(|current| {
                    if *current == view {
                        false
                    } else {
                        *current = view;
                        true
                    }
                });
            }),
        );

        let controller = &self.inner.controller;
        controller.watch(token.id, descriptor.clone(), policy.clone());
        controller.revalidate(&descriptor, Trigger::Mount, &policy);
        let poller = controller.start_polling(token.id);

        EntryHandle {
            key: Some(key),
            receiver,
            subscription: Some(ActiveSubscription {
                token,
                descriptor,
                policy,
                hub: Arc::clone(&self.inner.hub),
                controller: Arc::clone(&self.inner.controller),
                poller,
            }),
        }
    }

    /// Current view of a resource without subscribing
    pub fn peek(&self, descriptor: &Descriptor) -> EntryView {
        descriptor
            .key()
            .and_then(|key| self.inner.store.get(&key))
            .map(|entry| entry.view())
            .unwrap_or_default()
    }

    /// Apply an optimistic update and run `remote_write`; see
    /// [`MutationCoordinator::mutate`]
    pub fn mutate<U, W, Fut, R>(
        &self,
        key: &CacheKey,
        updater: U,
        remote_write: W,
        reconcile: Option<Reconcile<R>>,
    ) -> BoxFuture<'static, Result<R>>
    where
        U: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
        W: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        self.inner
            .mutations
            .mutate(key, updater, remote_write, reconcile)
    }

    /// Mark `key` stale; subscribed keys refetch right away
    pub fn invalidate(&self, key: &CacheKey) -> InvalidationEvent {
        let keys = if self.inner.controller.invalidate(key) {
            vec![key.clone()]
        } else {
            Vec::new()
        };
        InvalidationEvent::new(InvalidationReason::Manual, keys)
    }

    /// Explicitly revalidate a resource with the default policy
    pub fn revalidate(&self, descriptor: &Descriptor) -> Option<SharedFetch<Value>> {
        self.inner.controller.revalidate(
            descriptor,
            Trigger::Manual,
            &self.inner.config.default_policy,
        )
    }

    /// Drop every entry and pending mutation (logout, test isolation)
    pub fn clear_all(&self) -> InvalidationEvent {
        self.inner.mutations.clear();
        let keys = self.inner.store.clear();
        InvalidationEvent::new(InvalidationReason::Cleared, keys)
    }

    /// The host window regained focus
    pub fn on_focus(&self) -> usize {
        self.inner.controller.on_focus()
    }

    /// The network reconnected
    pub fn on_reconnect(&self) -> usize {
        self.inner.controller.on_reconnect()
    }

    /// Register where a realtime resource type is cached
    pub fn register_route(&self, route: ResourceRoute) {
        self.inner.realtime.register(route);
    }

    /// Change the actor whose own realtime events are suppressed
    pub fn set_local_actor_id(&self, actor_id: Option<String>) {
        self.inner.realtime.set_local_actor_id(actor_id);
    }

    /// Apply a realtime event
    pub fn handle_event(&self, event: &RealtimeEvent) -> RealtimeOutcome {
        self.inner.realtime.handle_event(event)
    }

    /// Decode and apply a raw realtime message
    pub fn handle_json(&self, message: &Value) -> Result<RealtimeOutcome> {
        self.inner.realtime.handle_json(message)
    }

    /// Evict entries idle for longer than the grace period
    pub fn evict_idle(&self) -> InvalidationEvent {
        self.inner.hub.evict_idle()
    }

    /// Number of subscriptions for `key`
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner.hub.subscriber_count(key)
    }

    /// Usage statistics
    pub fn stats(&self) -> SyncStats {
        self.inner.store.stats()
    }
}

impl fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("store", &self.inner.store)
            .field("controller", &self.inner.controller)
            .field("subscriptions", &self.inner.hub.len())
            .finish()
    }
}

struct ActiveSubscription {
    token: SubscriptionToken,
    descriptor: Descriptor,
    policy: RevalidationPolicy,
    hub: Arc<SubscriptionHub>,
    controller: Arc<RevalidationController>,
    poller: Option<JoinHandle<()>>,
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.controller.unwatch(&self.token.id);
        self.hub.unsubscribe(&self.token);
        debug!("Unsubscribed from {}", self.token.key);
    }
}

/// A consumer's live view of one resource.
///
/// Dropping the handle unsubscribes; an in-flight fetch still completes and
/// lands in the cache.
pub struct EntryHandle {
    key: Option<CacheKey>,
    receiver: watch::Receiver<EntryView>,
    subscription: Option<ActiveSubscription>,
}

impl EntryHandle {
    /// Key of the subscribed resource, `None` for a disabled handle
    pub fn key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }

    /// Whether the handle is subscribed to anything
    pub fn is_enabled(&self) -> bool {
        self.subscription.is_some()
    }

    /// Current data, error and status
    pub fn view(&self) -> EntryView {
        self.receiver.borrow().clone()
    }

    /// Current data
    pub fn data(&self) -> Option<Value> {
        self.receiver.borrow().data.clone()
    }

    /// Wait for the next change; false when the handle is disabled
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Wait until the view satisfies `predicate`
    pub async fn wait_until<F>(&mut self, predicate: F) -> Option<EntryView>
    where
        F: FnMut(&EntryView) -> bool,
    {
        self.receiver
            .wait_for(predicate)
            .await
            .ok()
            .map(|view| view.clone())
    }

    /// Explicitly revalidate with this subscription's policy
    pub fn revalidate(&self) -> Option<SharedFetch<Value>> {
        let subscription = self.subscription.as_ref()?;
        subscription.controller.revalidate(
            &subscription.descriptor,
            Trigger::Manual,
            &subscription.policy,
        )
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("key", &self.key)
            .field("status", &self.receiver.borrow().status)
            .finish()
    }
}
