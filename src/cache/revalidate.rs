//! Stale-while-revalidate controller
//!
//! Decides, per trigger and per subscription policy, whether a key should be
//! refetched, and runs the fetch pipeline:
//!
//! ```text
//! idle ──▶ loading ──▶ success ◀──▶ revalidating
//!              │          ▲              │
//!              ▼          │              ▼
//!            error ───────┴───────────  error (data retained)
//! ```
//!
//! Every fetch takes a sequence number from the store when it starts and
//! commits with [`CacheStore::set_if_newer`], so a completion that arrives
//! after a newer write is dropped.

use crate::cache::{
    config::RevalidationPolicy,
    dedup::{RequestDeduplicator, SharedFetch},
    entry::Entry,
    key::{CacheKey, Descriptor},
    mutation::MutationCoordinator,
    store::{CacheStore, WriteOutcome},
};
use crate::error::{Result, SyncError};
use crate::fetcher::ResourceFetcher;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What asked for a revalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// A subscription mounted
    Mount,
    /// The host window regained focus
    Focus,
    /// The network came back
    Reconnect,
    /// Polling tick
    Interval,
    /// Explicit revalidate call
    Manual,
    /// The entry was invalidated while subscribed
    Invalidation,
}

impl Trigger {
    /// Whether `policy` lets this trigger refetch data that is already cached
    pub fn enabled_by(&self, policy: &RevalidationPolicy) -> bool {
        match self {
            Trigger::Mount => policy.on_mount,
            Trigger::Focus => policy.on_focus,
            Trigger::Reconnect => policy.on_reconnect,
            Trigger::Interval => policy.poll_interval.is_some(),
            Trigger::Manual | Trigger::Invalidation => true,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Mount => write!(f, "mount"),
            Trigger::Focus => write!(f, "focus"),
            Trigger::Reconnect => write!(f, "reconnect"),
            Trigger::Interval => write!(f, "interval"),
            Trigger::Manual => write!(f, "manual"),
            Trigger::Invalidation => write!(f, "invalidation"),
        }
    }
}

/// Outcome of evaluating a trigger against an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Start a fetch
    Fetch,
    /// A fetch is already running; share it
    Join,
    /// The policy disables this trigger
    Disabled,
    /// The last fetch is more recent than the dedupe interval
    Throttled,
}

impl Decision {
    /// Whether the decision results in a fetch (new or shared)
    pub fn fetches(&self) -> bool {
        matches!(self, Decision::Fetch | Decision::Join)
    }
}

/// A mounted subscription the controller revalidates on global triggers
#[derive(Debug, Clone)]
struct Watch {
    key: CacheKey,
    descriptor: Descriptor,
    policy: RevalidationPolicy,
}

/// Stale-while-revalidate engine
pub struct RevalidationController {
    store: CacheStore,
    dedup: RequestDeduplicator<Value>,
    mutations: Arc<MutationCoordinator>,
    fetcher: Arc<dyn ResourceFetcher>,
    watches: Mutex<HashMap<Uuid, Watch>>,
}

impl RevalidationController {
    /// Create a controller fetching through `fetcher`
    pub fn new(
        store: CacheStore,
        mutations: Arc<MutationCoordinator>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Self {
        Self {
            store,
            dedup: RequestDeduplicator::new(),
            mutations,
            fetcher,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate `trigger` for `key` without acting on it
    pub fn decide(&self, key: &CacheKey, trigger: Trigger, policy: &RevalidationPolicy) -> Decision {
        if self.dedup.is_in_flight(key) {
            return Decision::Join;
        }

        let Some(entry) = self.store.get(key).filter(Entry::has_data) else {
            // Nothing to serve yet: any trigger loads, disabled or not
            return Decision::Fetch;
        };

        if !trigger.enabled_by(policy) {
            return Decision::Disabled;
        }

        if entry.metadata.stale || policy.dedupe_interval.is_zero() {
            return Decision::Fetch;
        }

        match entry.age(Instant::now()) {
            Some(age) if age < policy.dedupe_interval => Decision::Throttled,
            _ => Decision::Fetch,
        }
    }

    /// Apply `trigger` to the resource: fetch, join the running fetch, or skip.
    ///
    /// Returns the fetch to await, or `None` when the trigger was skipped or
    /// the descriptor is disabled.
    pub fn revalidate(
        &self,
        descriptor: &Descriptor,
        trigger: Trigger,
        policy: &RevalidationPolicy,
    ) -> Option<SharedFetch<Value>> {
        let key = descriptor.key()?;

        match self.decide(&key, trigger, policy) {
            Decision::Fetch | Decision::Join => Some(self.fetch(&key, descriptor, policy)),
            decision => {
                debug!("Skipping {} revalidation of {}: {:?}", trigger, key, decision);
                self.store.record(|s| s.revalidations_skipped += 1);
                None
            }
        }
    }

    /// Join the running fetch for `key` or start one, ignoring policy
    pub fn fetch(
        &self,
        key: &CacheKey,
        descriptor: &Descriptor,
        policy: &RevalidationPolicy,
    ) -> SharedFetch<Value> {
        let seq = self.store.begin_write();

        let store = self.store.clone();
        let mutations = Arc::clone(&self.mutations);
        let fetcher = Arc::clone(&self.fetcher);
        let commit_key = key.clone();
        let descriptor = descriptor.clone();
        let policy = policy.clone();

        let joined = self.dedup.join_or_start(key, move || async move {
            let result = AssertUnwindSafe(fetch_with_retries(
                fetcher.as_ref(),
                &commit_key,
                &descriptor,
                &policy,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(SyncError::fetch(commit_key.as_str(), "fetcher panicked")));

            commit(&store, &mutations, &commit_key, seq, &result);
            result
        });

        if joined.started {
            self.store.set(key, |entry| {
                if entry.metadata.write_seq < seq {
                    entry.begin_fetch()
                } else {
                    entry
                }
            });
            self.store.record(|s| s.fetches_started += 1);
        } else {
            self.store.record(|s| s.fetches_deduplicated += 1);
        }

        joined.fetch
    }

    /// Replace the data of a cached key with a pushed value, rebasing any
    /// pending mutations on it. Returns false when `key` is not cached or a
    /// newer write has already landed.
    pub fn patch(&self, key: &CacheKey, data: Value) -> bool {
        if !self.store.contains_key(key) {
            return false;
        }

        let seq = self.store.begin_write();
        let now = Instant::now();
        let outcome = self.store.set_if_newer(key, seq, |entry| {
            let shown = self
                .mutations
                .rebase(key, &data, seq, now)
                .unwrap_or_else(|| data.clone());
            entry.fetch_succeeded(shown, seq, now)
        });

        outcome == WriteOutcome::Applied
    }

    /// Whether a fetch is running for `key`
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.dedup.is_in_flight(key)
    }

    /// Register a mounted subscription for focus, reconnect, polling and
    /// invalidation triggers
    pub fn watch(&self, id: Uuid, descriptor: Descriptor, policy: RevalidationPolicy) -> bool {
        let Some(key) = descriptor.key() else {
            return false;
        };

        self.watches.lock().insert(
            id,
            Watch {
                key,
                descriptor,
                policy,
            },
        );
        true
    }

    /// Forget a subscription
    pub fn unwatch(&self, id: &Uuid) -> bool {
        self.watches.lock().remove(id).is_some()
    }

    /// Number of registered subscriptions
    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    /// The host window regained focus; returns the number of keys fetching
    pub fn on_focus(&self) -> usize {
        self.broadcast(Trigger::Focus)
    }

    /// The network reconnected; returns the number of keys fetching
    pub fn on_reconnect(&self) -> usize {
        self.broadcast(Trigger::Reconnect)
    }

    /// Mark `key` stale. A subscribed key refetches immediately, others on
    /// their next trigger. Returns false when `key` is not cached.
    ///
    /// A fetch already running for `key` was sent before the change being
    /// announced, so it is not joined: once it settles the key is fetched
    /// again.
    pub fn invalidate(self: &Arc<Self>, key: &CacheKey) -> bool {
        let seq = self.store.begin_write();
        if self
            .store
            .update_existing(key, |entry| entry.invalidated(seq))
            .is_none()
        {
            return false;
        }
        self.store.record(|s| s.invalidations += 1);

        let watched = self
            .watches
            .lock()
            .values()
            .find(|watch| &watch.key == key)
            .cloned();

        let Some(watch) = watched else {
            debug!("Invalidated key with no subscribers: {}", key);
            return true;
        };

        let running = self.dedup.in_flight(key);
        let runtime = tokio::runtime::Handle::try_current().ok();
        match (running, runtime) {
            (Some(running), Some(runtime)) => {
                debug!("Invalidated {} during a fetch, refetching after it settles", key);
                let controller: Weak<Self> = Arc::downgrade(self);
                runtime.spawn(async move {
                    let _ = running.await;
                    if let Some(controller) = controller.upgrade() {
                        controller.revalidate(
                            &watch.descriptor,
                            Trigger::Invalidation,
                            &watch.policy,
                        );
                    }
                });
            }
            _ => {
                debug!("Invalidated subscribed key, revalidating: {}", key);
                self.revalidate(&watch.descriptor, Trigger::Invalidation, &watch.policy);
            }
        }
        true
    }

    /// Spawn the polling loop for a registered subscription.
    ///
    /// Returns `None` when the subscription does not poll or no tokio
    /// runtime is running. The loop ends once the subscription is unwatched
    /// or the controller is dropped.
    pub fn start_polling(self: &Arc<Self>, id: Uuid) -> Option<JoinHandle<()>> {
        let watch = self.watches.lock().get(&id).cloned()?;
        if watch.policy.poll_interval.is_none() {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;

        let controller: Weak<Self> = Arc::downgrade(self);
        info!(
            "Starting poller for {} (interval: {:?})",
            watch.key, watch.policy.poll_interval
        );

        Some(runtime.spawn(async move {
            let mut policy = watch.policy;
            while let Some(delay) = policy.poll_delay_with_jitter() {
                tokio::time::sleep(delay).await;

                let Some(controller) = controller.upgrade() else {
                    break;
                };
                let Some(current) = controller.watches.lock().get(&id).cloned() else {
                    break;
                };

                controller.revalidate(&current.descriptor, Trigger::Interval, &current.policy);
                policy = current.policy;
            }
            debug!("Poller stopped: {}", watch.key);
        }))
    }

    fn broadcast(&self, trigger: Trigger) -> usize {
        let targets: Vec<Watch> = {
            let watches = self.watches.lock();
            let mut by_key: HashMap<&CacheKey, &Watch> = HashMap::new();
            for watch in watches.values() {
                if trigger.enabled_by(&watch.policy) {
                    by_key.entry(&watch.key).or_insert(watch);
                }
            }
            by_key.into_values().cloned().collect()
        };

        let fetching = targets
            .iter()
            .filter(|watch| {
                self.revalidate(&watch.descriptor, trigger, &watch.policy)
                    .is_some()
            })
            .count();

        debug!("{} trigger: {} of {} keys fetching", trigger, fetching, targets.len());
        fetching
    }
}

impl fmt::Debug for RevalidationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevalidationController")
            .field("in_flight", &self.dedup.len())
            .field("watches", &self.watch_count())
            .finish()
    }
}

/// Run the fetcher with the policy's timeout and retry settings
async fn fetch_with_retries(
    fetcher: &dyn ResourceFetcher,
    key: &CacheKey,
    descriptor: &Descriptor,
    policy: &RevalidationPolicy,
) -> Result<Value> {
    let attempts = policy.attempts();
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            debug!(
                "Retrying fetch of {} (attempt {}/{})",
                key,
                attempt + 1,
                attempts
            );
            tokio::time::sleep(policy.retry_delay).await;
        }

        match fetch_once(fetcher, key, descriptor, policy).await {
            Ok(data) => return Ok(data),
            Err(e) => {
                warn!("Fetch attempt {} for {} failed: {}", attempt + 1, key, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| SyncError::fetch(key.as_str(), "no fetch attempted")))
}

async fn fetch_once(
    fetcher: &dyn ResourceFetcher,
    key: &CacheKey,
    descriptor: &Descriptor,
    policy: &RevalidationPolicy,
) -> Result<Value> {
    let call = fetcher.fetch(descriptor);

    let outcome = match policy.fetch_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(SyncError::TimeoutError {
                    timeout_ms: timeout.as_millis() as u64,
                    context: format!("fetching {}", key),
                })
            }
        },
        None => call.await,
    };

    outcome.map_err(|e| SyncError::fetch(key.as_str(), format!("{:#}", e)))
}

/// Land a fetch result in the store unless a newer write got there first
fn commit(
    store: &CacheStore,
    mutations: &MutationCoordinator,
    key: &CacheKey,
    seq: u64,
    result: &Result<Value>,
) {
    let now = Instant::now();
    let outcome = match result {
        Ok(data) => store.set_if_newer(key, seq, |entry| {
            let shown = mutations
                .rebase(key, data, seq, now)
                .unwrap_or_else(|| data.clone());
            entry.fetch_succeeded(shown, seq, now)
        }),
        Err(error) => {
            store.record(|s| s.fetch_failures += 1);
            store.set_if_newer(key, seq, |entry| entry.fetch_failed(error.clone(), seq))
        }
    };

    if outcome == WriteOutcome::StaleIgnored {
        store.update_existing(key, Entry::fetch_superseded);
    }
}
