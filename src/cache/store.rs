//! Process-wide entry store with per-key listeners
//!
//! The store is the single source of truth: every component reads and writes
//! entries through it, and every write notifies the listeners of that key
//! only. Updaters run under the write lock, listeners run after it has been
//! released so they may read the store again.

use crate::cache::{
    entry::Entry,
    key::CacheKey,
    types::SyncStats,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Callback invoked with the full current entry after every change
pub type Listener = Arc<dyn Fn(&Entry) + Send + Sync>;

/// Handle for a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Result of a sequenced write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write replaced the entry
    Applied,
    /// A newer write had already landed; nothing changed
    StaleIgnored,
}

/// Shared, in-memory entry store
///
/// Cloning the store yields another handle to the same entries.
#[derive(Clone)]
pub struct CacheStore {
    shared: Arc<StoreShared>,
}

struct StoreShared {
    state: RwLock<StoreState>,
    next_seq: AtomicU64,
    /// Writes sequenced at or below this were started before the last clear
    cleared_through: AtomicU64,
    next_listener: AtomicU64,
    enable_metrics: bool,
}

/// Internal storage
struct StoreState {
    /// key -> entry
    entries: HashMap<CacheKey, Entry>,

    /// key -> listeners, in registration order
    listeners: HashMap<CacheKey, Vec<(ListenerId, Listener)>>,

    /// key -> active consumers; survives `clear` like the listeners do
    subscribers: HashMap<CacheKey, usize>,

    stats: SyncStats,
}

impl CacheStore {
    /// Create an empty store with statistics enabled
    pub fn new() -> Self {
        Self::with_metrics(true)
    }

    /// Create an empty store, choosing whether statistics are collected
    pub fn with_metrics(enable_metrics: bool) -> Self {
        info!("Initializing cache store (metrics: {})", enable_metrics);

        Self {
            shared: Arc::new(StoreShared {
                state: RwLock::new(StoreState {
                    entries: HashMap::new(),
                    listeners: HashMap::new(),
                    subscribers: HashMap::new(),
                    stats: SyncStats::default(),
                }),
                next_seq: AtomicU64::new(0),
                cleared_through: AtomicU64::new(0),
                next_listener: AtomicU64::new(0),
                enable_metrics,
            }),
        }
    }

    /// Snapshot of the entry for `key`
    pub fn get(&self, key: &CacheKey) -> Option<Entry> {
        self.shared.state.read().entries.get(key).cloned()
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.shared.state.read().entries.contains_key(key)
    }

    /// Replace the entry for `key` with `updater(current)`.
    ///
    /// A missing entry is created from `Entry::default()`. Returns the entry
    /// that was stored.
    pub fn set<F>(&self, key: &CacheKey, updater: F) -> Entry
    where
        F: FnOnce(Entry) -> Entry,
    {
        let (entry, listeners) = {
            let mut state = self.shared.state.write();
            let current = state.entries.get(key).cloned().unwrap_or_default();
            let entry = store_entry(&mut state, key, updater(current));
            (entry, listeners_for(&state, key))
        };

        notify(&listeners, &entry);
        entry
    }

    /// Like [`set`](Self::set), but leaves missing keys missing
    pub fn update_existing<F>(&self, key: &CacheKey, updater: F) -> Option<Entry>
    where
        F: FnOnce(Entry) -> Entry,
    {
        let (entry, listeners) = {
            let mut state = self.shared.state.write();
            let current = state.entries.get(key).cloned()?;
            let entry = store_entry(&mut state, key, updater(current));
            (entry, listeners_for(&state, key))
        };

        notify(&listeners, &entry);
        Some(entry)
    }

    /// Apply `updater` only if `seq` is not older than the write that
    /// produced the stored data.
    pub fn set_if_newer<F>(&self, key: &CacheKey, seq: u64, updater: F) -> WriteOutcome
    where
        F: FnOnce(Entry) -> Entry,
    {
        let (entry, listeners) = {
            let mut state = self.shared.state.write();
            let current = state.entries.get(key).cloned().unwrap_or_default();

            if seq < current.metadata.write_seq
                || seq <= self.shared.cleared_through.load(Ordering::SeqCst)
            {
                debug!(
                    "Ignoring stale write for {} (seq {} < {})",
                    key, seq, current.metadata.write_seq
                );
                if self.shared.enable_metrics {
                    state.stats.stale_writes_ignored += 1;
                }
                return WriteOutcome::StaleIgnored;
            }

            let entry = store_entry(&mut state, key, updater(current));
            (entry, listeners_for(&state, key))
        };

        notify(&listeners, &entry);
        WriteOutcome::Applied
    }

    /// Count one more consumer of `key`, creating the entry if needed
    pub fn retain(&self, key: &CacheKey) -> Entry {
        let (entry, listeners) = {
            let mut state = self.shared.state.write();
            *state.subscribers.entry(key.clone()).or_insert(0) += 1;
            let current = state.entries.get(key).cloned().unwrap_or_default();
            let entry = store_entry(&mut state, key, current);
            (entry, listeners_for(&state, key))
        };

        notify(&listeners, &entry);
        entry
    }

    /// Count one consumer of `key` fewer. Returns the updated entry when
    /// one is cached.
    pub fn release(&self, key: &CacheKey) -> Option<Entry> {
        let (entry, listeners) = {
            let mut state = self.shared.state.write();
            if let Some(count) = state.subscribers.get_mut(key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.subscribers.remove(key);
                }
            }
            let current = state.entries.get(key).cloned()?;
            let entry = store_entry(&mut state, key, current);
            (entry, listeners_for(&state, key))
        };

        notify(&listeners, &entry);
        Some(entry)
    }

    /// Number of consumers currently counted for `key`
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.shared
            .state
            .read()
            .subscribers
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Remove the entry for `key`; listeners see an idle entry
    pub fn delete(&self, key: &CacheKey) -> Option<Entry> {
        let (removed, listeners) = {
            let mut state = self.shared.state.write();
            let removed = state.entries.remove(key);
            (removed, listeners_for(&state, key))
        };

        if removed.is_some() {
            debug!("Removed cache entry: {}", key);
            notify(&listeners, &Entry::default());
        }
        removed
    }

    /// Drop every entry. Listeners stay registered and see idle entries.
    ///
    /// Sequenced writes allocated before the clear are ignored afterwards, so
    /// a fetch still running at logout cannot repopulate the cache.
    pub fn clear(&self) -> Vec<CacheKey> {
        let (keys, notifications) = {
            let mut state = self.shared.state.write();
            self.shared.cleared_through.store(
                self.shared.next_seq.load(Ordering::SeqCst),
                Ordering::SeqCst,
            );
            let keys: Vec<CacheKey> = state.entries.drain().map(|(key, _)| key).collect();
            let notifications: Vec<Vec<Listener>> =
                keys.iter().map(|key| listeners_for(&state, key)).collect();
            (keys, notifications)
        };

        let idle = Entry::default();
        for listeners in &notifications {
            notify(listeners, &idle);
        }

        info!("Cleared {} entries from cache", keys.len());
        keys
    }

    /// Register a listener for `key`
    pub fn subscribe(&self, key: &CacheKey, listener: Listener) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared
            .state
            .write()
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a listener; returns false when it was not registered
    pub fn unsubscribe(&self, key: &CacheKey, id: ListenerId) -> bool {
        let mut state = self.shared.state.write();
        let Some(listeners) = state.listeners.get_mut(key) else {
            return false;
        };

        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;

        if listeners.is_empty() {
            state.listeners.remove(key);
        }
        removed
    }

    /// Number of listeners registered for `key`
    pub fn listener_count(&self, key: &CacheKey) -> usize {
        self.shared
            .state
            .read()
            .listeners
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Allocate the sequence number for a fetch or mutation that is starting
    pub fn begin_write(&self) -> u64 {
        self.shared.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Evict every entry that has been idle for at least `grace`
    pub fn evict_idle(&self, grace: Duration) -> Vec<CacheKey> {
        let now = Instant::now();
        let (evicted, notifications) = {
            let mut state = self.shared.state.write();
            let evicted: Vec<CacheKey> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_evictable(now, grace))
                .map(|(key, _)| key.clone())
                .collect();

            for key in &evicted {
                state.entries.remove(key);
            }
            if self.shared.enable_metrics {
                state.stats.evictions += evicted.len() as u64;
            }

            let notifications: Vec<Vec<Listener>> =
                evicted.iter().map(|key| listeners_for(&state, key)).collect();
            (evicted, notifications)
        };

        let idle = Entry::default();
        for listeners in &notifications {
            notify(listeners, &idle);
        }

        if !evicted.is_empty() {
            debug!("Evicted {} idle entries", evicted.len());
        }
        evicted
    }

    /// All keys currently cached
    pub fn keys(&self) -> Vec<CacheKey> {
        self.shared.state.read().entries.keys().cloned().collect()
    }

    /// Get number of entries in the store
    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.shared.state.read().entries.is_empty()
    }

    /// Update statistics (no-op when metrics are disabled)
    pub fn record<F>(&self, update: F)
    where
        F: FnOnce(&mut SyncStats),
    {
        if self.shared.enable_metrics {
            update(&mut self.shared.state.write().stats);
        }
    }

    /// Get statistics
    pub fn stats(&self) -> SyncStats {
        self.shared.state.read().stats.clone()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("CacheStore")
            .field("entries", &state.entries.len())
            .field("listened_keys", &state.listeners.len())
            .field("subscribed_keys", &state.subscribers.len())
            .finish()
    }
}

/// Stamp store-maintained metadata onto a replacement entry and store it
fn store_entry(state: &mut StoreState, key: &CacheKey, entry: Entry) -> Entry {
    let previous_version = state
        .entries
        .get(key)
        .map(|e| e.metadata.version)
        .unwrap_or(0);
    let subscribers = state.subscribers.get(key).copied().unwrap_or(0);
    let entry = finalize(previous_version, subscribers, entry);
    state.entries.insert(key.clone(), entry.clone());
    entry
}

fn finalize(previous_version: u64, subscribers: usize, mut entry: Entry) -> Entry {
    entry.metadata.version = previous_version + 1;
    entry.metadata.subscriber_count = subscribers;

    if entry.metadata.subscriber_count == 0 {
        if entry.metadata.idle_since.is_none() {
            entry.metadata.idle_since = Some(Instant::now());
        }
    } else {
        entry.metadata.idle_since = None;
    }

    entry
}

fn listeners_for(state: &StoreState, key: &CacheKey) -> Vec<Listener> {
    state
        .listeners
        .get(key)
        .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
        .unwrap_or_default()
}

fn notify(listeners: &[Listener], entry: &Entry) {
    for listener in listeners {
        listener(entry);
    }
}
