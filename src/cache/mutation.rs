//! Optimistic mutations with rollback
//!
//! A mutation writes its optimistic value immediately, runs the remote
//! write, then either confirms (optionally replacing the data with the
//! server's answer) or rolls back.
//!
//! Overlapping mutations on one key are tracked in a per-key log:
//! - `base`: the entry as it was before the oldest pending mutation,
//!   advanced by confirmations and by fetches that land meanwhile
//! - `pending`: optimistic updaters still waiting for their remote write,
//!   in start order
//!
//! What consumers see is always `base` with the pending updaters replayed.
//! `base.metadata.write_seq` is the sequence of the last write the log
//! accepted from outside, so a rollback can hand the entry back to fetches
//! that started before the optimistic write.
//! Rolling back one mutation therefore removes only its own change: with
//! `[1]`, A appending 2 and B appending 3, a failing A leaves `[1, 3]`.

use crate::cache::{entry::Entry, entry::EntryStatus, key::CacheKey, store::CacheStore};
use crate::error::{Result, SyncError};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Optimistic updater: previous data (if any) to new data. Must be pure, it
/// may be replayed when an earlier mutation rolls back.
pub type Updater = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;

/// Maps the remote write's result to the data that replaces the optimistic value
pub type Reconcile<R> = Box<dyn FnOnce(&R) -> Value + Send>;

struct PendingMutation {
    id: u64,
    seq: u64,
    updater: Updater,
}

struct MutationLog {
    base: Entry,
    pending: Vec<PendingMutation>,
}

impl MutationLog {
    fn replay(&self) -> Option<Value> {
        replay(self.base.data.clone(), &self.pending)
    }
}

fn replay(base: Option<Value>, pending: &[PendingMutation]) -> Option<Value> {
    pending
        .iter()
        .fold(base, |data, mutation| Some((mutation.updater)(data.as_ref())))
}

/// Coordinates optimistic writes against the store
pub struct MutationCoordinator {
    store: CacheStore,
    logs: Mutex<HashMap<CacheKey, MutationLog>>,
    next_id: AtomicU64,
}

impl MutationCoordinator {
    /// Create a coordinator writing to `store`
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            logs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Apply `updater` optimistically, then run `remote_write`.
    ///
    /// The optimistic value is written before this function returns, so
    /// consumers see it before the returned future is first polled. The
    /// future resolves to the remote write's result; on failure the entry is
    /// rolled back and a [`SyncError::MutationError`] is returned.
    pub fn mutate<U, W, Fut, R>(
        self: &Arc<Self>,
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
        let id = self.apply_optimistic(key, Arc::new(updater));
        let write = remote_write();

        let this = Arc::clone(self);
        let key = key.clone();
        async move {
            match write.await {
                Ok(server) => {
                    let reconciled = reconcile.map(|reconcile| reconcile(&server));
                    this.confirm(&key, id, reconciled);
                    Ok(server)
                }
                Err(e) => {
                    warn!("Remote write failed for {}, rolling back: {:#}", key, e);
                    this.rollback(&key, id);
                    Err(SyncError::mutation(key.as_str(), format!("{:#}", e)))
                }
            }
        }
        .boxed()
    }

    /// Whether `key` has mutations waiting for their remote write
    pub fn has_pending(&self, key: &CacheKey) -> bool {
        self.logs.lock().contains_key(key)
    }

    /// Number of pending mutations for `key`
    pub fn pending_count(&self, key: &CacheKey) -> usize {
        self.logs
            .lock()
            .get(key)
            .map(|log| log.pending.len())
            .unwrap_or(0)
    }

    /// Rebase pending mutations on freshly fetched data.
    ///
    /// Returns the data consumers should see, or `None` when `key` has no
    /// pending mutations (the fetched data is then shown as is).
    pub fn rebase(
        &self,
        key: &CacheKey,
        fetched: &Value,
        seq: u64,
        now: Instant,
    ) -> Option<Value> {
        let mut logs = self.logs.lock();
        let log = logs.get_mut(key)?;

        log.base.data = Some(fetched.clone());
        log.base.error = None;
        log.base.status = EntryStatus::Success;
        log.base.metadata.last_fetched_at = Some(now);
        log.base.metadata.write_seq = log.base.metadata.write_seq.max(seq);

        debug!(
            "Rebasing {} pending mutation(s) on fetched data: {}",
            log.pending.len(),
            key
        );
        log.replay()
    }

    /// Forget every pending mutation (global clear); their eventual
    /// confirmations and rollbacks become no-ops.
    pub fn clear(&self) {
        self.logs.lock().clear();
    }

    fn apply_optimistic(&self, key: &CacheKey, updater: Updater) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.store.begin_write();
        let current = self.store.get(key).unwrap_or_default();

        let pending = {
            let mut logs = self.logs.lock();
            let log = logs.entry(key.clone()).or_insert_with(|| MutationLog {
                base: current,
                pending: Vec::new(),
            });
            log.pending.push(PendingMutation {
                id,
                seq,
                updater: Arc::clone(&updater),
            });
            log.pending.len()
        };

        self.store.set(key, move |mut entry| {
            entry.data = Some(updater(entry.data.as_ref()));
            entry.metadata.write_seq = seq;
            entry.metadata.pending_mutations = pending;
            entry
        });

        debug!("Applied optimistic mutation {} to {}", id, key);
        id
    }

    fn confirm(&self, key: &CacheKey, id: u64, reconciled: Option<Value>) {
        let now = Instant::now();
        let seq = self.store.begin_write();
        let settled = {
            let mut logs = self.logs.lock();
            let Some(log) = logs.get_mut(key) else {
                debug!("Confirmation for cleared mutation {} on {}", id, key);
                return;
            };
            let Some(pos) = log.pending.iter().position(|m| m.id == id) else {
                return;
            };
            let confirmed = log.pending.remove(pos);

            log.base.data = match reconciled {
                Some(server) => Some(server),
                None => Some((confirmed.updater)(log.base.data.as_ref())),
            };
            log.base.error = None;
            log.base.status = EntryStatus::Success;
            log.base.metadata.last_fetched_at = Some(now);
            log.base.metadata.write_seq = seq;

            let shown = log.replay();
            let remaining = log.pending.len();
            if remaining == 0 {
                logs.remove(key);
            }
            (shown, remaining)
        };

        let (shown, remaining) = settled;
        self.store.set(key, move |mut entry| {
            entry.data = shown;
            entry.error = None;
            if !entry.metadata.in_flight {
                entry.status = EntryStatus::Success;
            }
            entry.metadata.last_fetched_at = Some(now);
            entry.metadata.write_seq = seq;
            entry.metadata.pending_mutations = remaining;
            entry
        });

        self.store.record(|s| s.mutations_confirmed += 1);
        debug!("Confirmed mutation {} on {}", id, key);
    }

    fn rollback(&self, key: &CacheKey, id: u64) {
        let restored = {
            let mut logs = self.logs.lock();
            let Some(log) = logs.get_mut(key) else {
                debug!("Rollback for cleared mutation {} on {}", id, key);
                return;
            };
            let Some(pos) = log.pending.iter().position(|m| m.id == id) else {
                return;
            };
            let failed = log.pending.remove(pos);

            // Sequences written by this log; anything else came from outside
            let mut owned: Vec<u64> = log.pending.iter().map(|m| m.seq).collect();
            owned.push(failed.seq);

            let shown = log.replay();
            let remaining = log.pending.len();
            let error = log.base.error.clone();
            let status = log.base.status;
            let last_fetched_at = log.base.metadata.last_fetched_at;
            let base_seq = log.base.metadata.write_seq;
            if remaining == 0 {
                logs.remove(key);
            }
            (shown, error, status, last_fetched_at, remaining, owned, base_seq)
        };

        let (shown, error, status, last_fetched_at, remaining, owned, base_seq) = restored;
        self.store.set(key, move |mut entry| {
            entry.data = shown;
            entry.error = error;
            entry.metadata.last_fetched_at = last_fetched_at;
            entry.metadata.pending_mutations = remaining;
            if owned.contains(&entry.metadata.write_seq) {
                entry.metadata.write_seq = base_seq;
            }
            entry.status = if entry.metadata.in_flight {
                entry.status
            } else if status.is_fetching() {
                if entry.data.is_some() {
                    EntryStatus::Success
                } else {
                    EntryStatus::Idle
                }
            } else {
                status
            };
            entry
        });

        self.store.record(|s| s.mutations_rolled_back += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::Descriptor;
    use crate::cache::store::WriteOutcome;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn append(id: i64) -> impl Fn(Option<&Value>) -> Value + Send + Sync + 'static {
        move |data| {
            let mut items = data
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            items.push(json!(id));
            Value::Array(items)
        }
    }

    fn setup(initial: Value) -> (CacheStore, Arc<MutationCoordinator>, CacheKey) {
        let store = CacheStore::new();
        let key = Descriptor::new("/campaigns").key().unwrap();
        let seq = store.begin_write();
        store.set(&key, |e| e.fetch_succeeded(initial, seq, Instant::now()));
        let coordinator = Arc::new(MutationCoordinator::new(store.clone()));
        (store, coordinator, key)
    }

    fn data(store: &CacheStore, key: &CacheKey) -> Option<Value> {
        store.get(key).and_then(|e| e.data)
    }

    #[tokio::test]
    async fn test_optimistic_value_is_visible_immediately() {
        let (store, coordinator, key) = setup(json!([1]));
        let (tx, rx) = oneshot::channel::<()>();

        let pending = coordinator.mutate(
            &key,
            append(2),
            move || async move {
                rx.await?;
                Ok::<_, anyhow::Error>(())
            },
            None::<Reconcile<()>>,
        );

        assert_eq!(data(&store, &key), Some(json!([1, 2])));
        assert_eq!(coordinator.pending_count(&key), 1);

        tx.send(()).unwrap();
        pending.await.unwrap();

        assert_eq!(data(&store, &key), Some(json!([1, 2])));
        assert!(!coordinator.has_pending(&key));
        assert_eq!(store.stats().mutations_confirmed, 1);
    }

    #[tokio::test]
    async fn test_reconcile_replaces_optimistic_data() {
        let (store, coordinator, key) = setup(json!([1]));
        let reconcile: Reconcile<Value> = Box::new(|server: &Value| server.clone());

        let result = coordinator
            .mutate(
                &key,
                append(2),
                || async { Ok(json!([1, 2, 3])) },
                Some(reconcile),
            )
            .await
            .unwrap();

        assert_eq!(result, json!([1, 2, 3]));
        assert_eq!(data(&store, &key), Some(json!([1, 2, 3])));
        let entry = store.get(&key).unwrap();
        assert_eq!(entry.status, EntryStatus::Success);
        assert_eq!(entry.metadata.pending_mutations, 0);
    }

    #[tokio::test]
    async fn test_failed_write_restores_snapshot_exactly() {
        let (store, coordinator, key) = setup(json!([1]));
        store.set(&key, |mut e| {
            e.status = EntryStatus::Error;
            e.error = Some(SyncError::fetch("/campaigns", "earlier failure"));
            e
        });
        let before = store.get(&key).unwrap();

        let result = coordinator
            .mutate(
                &key,
                append(2),
                || async { Err::<(), _>(anyhow::anyhow!("403 Forbidden")) },
                None,
            )
            .await;

        assert!(matches!(result, Err(SyncError::MutationError { .. })));
        let after = store.get(&key).unwrap();
        assert_eq!(after.data, before.data);
        assert_eq!(after.error, before.error);
        assert_eq!(after.status, before.status);
        assert_eq!(store.stats().mutations_rolled_back, 1);
    }

    #[tokio::test]
    async fn test_later_mutation_rolls_back_to_earlier_optimistic_state() {
        let (store, coordinator, key) = setup(json!([1]));
        let (tx_a, rx_a) = oneshot::channel::<bool>();
        let (tx_b, rx_b) = oneshot::channel::<bool>();

        let a = coordinator.mutate(&key, append(2), gated(rx_a), None);
        let b = coordinator.mutate(&key, append(3), gated(rx_b), None);
        assert_eq!(data(&store, &key), Some(json!([1, 2, 3])));

        tx_b.send(false).unwrap();
        assert!(b.await.is_err());
        assert_eq!(data(&store, &key), Some(json!([1, 2])));

        tx_a.send(true).unwrap();
        a.await.unwrap();
        assert_eq!(data(&store, &key), Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn test_earlier_rollback_keeps_later_optimistic_change() {
        let (store, coordinator, key) = setup(json!([1]));
        let (tx_a, rx_a) = oneshot::channel::<bool>();
        let (tx_b, rx_b) = oneshot::channel::<bool>();

        let a = coordinator.mutate(&key, append(2), gated(rx_a), None);
        let b = coordinator.mutate(&key, append(3), gated(rx_b), None);

        tx_a.send(false).unwrap();
        assert!(a.await.is_err());
        assert_eq!(data(&store, &key), Some(json!([1, 3])));
        assert_eq!(coordinator.pending_count(&key), 1);

        tx_b.send(true).unwrap();
        b.await.unwrap();
        assert_eq!(data(&store, &key), Some(json!([1, 3])));
        assert!(!coordinator.has_pending(&key));
    }

    #[tokio::test]
    async fn test_rollback_lets_earlier_fetch_land() {
        let (store, coordinator, key) = setup(json!([1]));
        let before = store.get(&key).unwrap().metadata.write_seq;
        let fetch_seq = store.begin_write();
        let (tx, rx) = oneshot::channel::<bool>();

        let a = coordinator.mutate(&key, append(2), gated(rx), None);
        assert!(store.get(&key).unwrap().metadata.write_seq > fetch_seq);

        tx.send(false).unwrap();
        assert!(a.await.is_err());
        assert_eq!(store.get(&key).unwrap().metadata.write_seq, before);

        let outcome = store.set_if_newer(&key, fetch_seq, |e| {
            e.fetch_succeeded(json!([1, 5]), fetch_seq, Instant::now())
        });
        assert_eq!(outcome, WriteOutcome::Applied);
        assert_eq!(data(&store, &key), Some(json!([1, 5])));
    }

    #[tokio::test]
    async fn test_rebase_replays_pending_on_fetched_data() {
        let (store, coordinator, key) = setup(json!([1]));
        let (tx, rx) = oneshot::channel::<bool>();

        let a = coordinator.mutate(&key, append(2), gated(rx), None);
        let seq = store.begin_write();
        let shown = coordinator.rebase(&key, &json!([1, 9]), seq, Instant::now());
        assert_eq!(shown, Some(json!([1, 9, 2])));

        tx.send(false).unwrap();
        assert!(a.await.is_err());
        assert_eq!(data(&store, &key), Some(json!([1, 9])));
    }

    #[tokio::test]
    async fn test_rebase_without_pending_is_none() {
        let (_store, coordinator, key) = setup(json!([1]));
        assert!(coordinator.rebase(&key, &json!([2]), 1, Instant::now()).is_none());
    }

    #[tokio::test]
    async fn test_mutation_on_empty_key() {
        let store = CacheStore::new();
        let coordinator = Arc::new(MutationCoordinator::new(store.clone()));
        let key = Descriptor::new("/drafts").key().unwrap();

        let result = coordinator
            .mutate(
                &key,
                append(1),
                || async { Err::<(), _>(anyhow::anyhow!("offline")) },
                None,
            )
            .await;

        assert!(result.is_err());
        let entry = store.get(&key).unwrap();
        assert!(entry.data.is_none());
        assert_eq!(entry.status, EntryStatus::Idle);
    }

    fn gated(
        rx: oneshot::Receiver<bool>,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<()>> {
        move || {
            async move {
                if rx.await? {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("rejected"))
                }
            }
            .boxed()
        }
    }
}
