//! In-flight request deduplication
//!
//! At most one fetch per key runs at any time. Callers that arrive while a
//! fetch is running receive a clone of the same [`Shared`] future, so the
//! producer runs once and everyone observes its result.
//!
//! The in-flight marker is removed inside the shared future, before its
//! output becomes visible: a call issued right after settlement starts a fresh
//! fetch instead of replaying the finished one.

use crate::cache::key::CacheKey;
use crate::error::{Result, SyncError};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Future shared by every caller of one deduplicated fetch
pub type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

type Registry<T> = Arc<Mutex<HashMap<CacheKey, (u64, SharedFetch<T>)>>>;

/// Outcome of asking the deduplicator for a fetch
pub struct Joined<T: Clone> {
    /// The shared fetch to await
    pub fetch: SharedFetch<T>,

    /// True when this call started the fetch, false when it joined one
    pub started: bool,
}

/// Per-key in-flight request registry
pub struct RequestDeduplicator<T: Clone> {
    in_flight: Registry<T>,
    next_generation: AtomicU64,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty deduplicator
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Return the in-flight fetch for `key`, or start one with `producer`.
    pub fn fetch_once<F, Fut>(&self, key: &CacheKey, producer: F) -> SharedFetch<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.join_or_start(key, producer).fetch
    }

    /// Like [`fetch_once`](Self::fetch_once), also reporting whether this call
    /// started the fetch.
    ///
    /// `producer` is invoked while the registry is locked and must not call
    /// back into this deduplicator. A producer that panics is turned into a
    /// failed fetch; its marker is cleared like any other.
    ///
    /// When a tokio runtime is available the fetch is driven by a spawned
    /// task, so it runs to completion even if every caller drops its handle.
    pub fn join_or_start<F, Fut>(&self, key: &CacheKey, producer: F) -> Joined<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fetch = {
            let mut in_flight = self.in_flight.lock();
            if let Some((_, fetch)) = in_flight.get(key) {
                debug!("Joining in-flight fetch: {}", key);
                return Joined {
                    fetch: fetch.clone(),
                    started: false,
                };
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let work: BoxFuture<'static, Result<T>> =
                match std::panic::catch_unwind(AssertUnwindSafe(producer)) {
                    Ok(fut) => fut.boxed(),
                    Err(_) => {
                        warn!("Fetch producer panicked before starting: {}", key);
                        let failed_key = key.to_string();
                        async move { Err(SyncError::fetch(failed_key, "producer panicked")) }
                            .boxed()
                    }
                };

            let registry = Arc::clone(&self.in_flight);
            let owned_key = key.clone();
            let fetch = async move {
                let result = match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Fetch producer panicked: {}", owned_key);
                        Err(SyncError::fetch(owned_key.as_str(), "producer panicked"))
                    }
                };

                let mut in_flight = registry.lock();
                let owned = in_flight
                    .get(&owned_key)
                    .map(|(g, _)| *g == generation)
                    .unwrap_or(false);
                if owned {
                    in_flight.remove(&owned_key);
                }

                result
            }
            .boxed()
            .shared();

            in_flight.insert(key.clone(), (generation, fetch.clone()));
            debug!("Started fetch: {} (generation {})", key, generation);
            fetch
        };

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(fetch.clone().map(|_| ()));
        }

        Joined {
            fetch,
            started: true,
        }
    }

    /// Whether a fetch is running for `key`
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// The running fetch for `key`, if any
    pub fn in_flight(&self, key: &CacheKey) -> Option<SharedFetch<T>> {
        self.in_flight
            .lock()
            .get(key)
            .map(|(_, fetch)| fetch.clone())
    }

    /// Number of keys with a running fetch
    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Whether no fetch is running
    pub fn is_empty(&self) -> bool {
        self.in_flight.lock().is_empty()
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
