//! Cache entry snapshots and their state transitions
//!
//! Entries are immutable values: every transition below consumes an entry and
//! returns the replacement, which the store then swaps in.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::time::Instant;

/// Lifecycle status of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Never fetched
    #[default]
    Idle,
    /// First fetch running, no data yet
    Loading,
    /// Background refetch running, stale data still served
    Revalidating,
    /// Last fetch or mutation succeeded
    Success,
    /// Last fetch failed (previous data, if any, is retained)
    Error,
}

impl EntryStatus {
    /// Whether a fetch is currently running for the entry
    pub fn is_fetching(&self) -> bool {
        matches!(self, EntryStatus::Loading | EntryStatus::Revalidating)
    }

    /// Whether the entry has settled (fetch finished either way)
    pub fn is_settled(&self) -> bool {
        matches!(self, EntryStatus::Success | EntryStatus::Error)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStatus::Idle => write!(f, "idle"),
            EntryStatus::Loading => write!(f, "loading"),
            EntryStatus::Revalidating => write!(f, "revalidating"),
            EntryStatus::Success => write!(f, "success"),
            EntryStatus::Error => write!(f, "error"),
        }
    }
}

/// Bookkeeping attached to every entry
#[derive(Debug, Clone, Default)]
pub struct EntryMetadata {
    /// Last successful population (fetch, confirmed mutation or patch)
    pub last_fetched_at: Option<Instant>,

    /// A fetch owned by the deduplicator is outstanding
    pub in_flight: bool,

    /// Number of active consumers, maintained by the store
    pub subscriber_count: usize,

    /// Invalidated; the next trigger bypasses the throttle
    pub stale: bool,

    /// Sequence allocated by the last invalidation. Only data from a write
    /// sequenced after it clears `stale`.
    pub stale_seq: u64,

    /// Sequence number of the write that produced `data`
    pub write_seq: u64,

    /// When the subscriber count last dropped to zero
    pub idle_since: Option<Instant>,

    /// Optimistic mutations awaiting their remote write
    pub pending_mutations: usize,

    /// Incremented on every replacement
    pub version: u64,
}

/// Cached state for one key
#[derive(Debug, Clone, Default)]
pub struct Entry {
    /// Last known value
    pub data: Option<Value>,

    /// Last error, cleared by the next successful fetch
    pub error: Option<SyncError>,

    /// Lifecycle status
    pub status: EntryStatus,

    /// Entry metadata
    pub metadata: EntryMetadata,
}

impl Entry {
    /// Whether the entry holds data
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Time since the last successful population
    pub fn age(&self, now: Instant) -> Option<std::time::Duration> {
        self.metadata
            .last_fetched_at
            .map(|at| now.saturating_duration_since(at))
    }

    /// Whether the entry has been idle (no subscribers) for at least `grace`.
    /// Entries with a fetch or a mutation outstanding are never evictable.
    pub fn is_evictable(&self, now: Instant, grace: std::time::Duration) -> bool {
        self.metadata.subscriber_count == 0
            && !self.metadata.in_flight
            && self.metadata.pending_mutations == 0
            && self
                .metadata
                .idle_since
                .map(|since| now.saturating_duration_since(since) >= grace)
                .unwrap_or(false)
    }

    /// A fetch starts: `loading` without data, `revalidating` with data
    pub fn begin_fetch(mut self) -> Self {
        self.status = if self.data.is_some() {
            EntryStatus::Revalidating
        } else {
            EntryStatus::Loading
        };
        self.metadata.in_flight = true;
        self
    }

    /// A fetch (or patch) delivered fresh data
    pub fn fetch_succeeded(mut self, data: Value, seq: u64, now: Instant) -> Self {
        self.data = Some(data);
        self.error = None;
        self.status = EntryStatus::Success;
        self.metadata.last_fetched_at = Some(now);
        self.metadata.in_flight = false;
        if seq > self.metadata.stale_seq {
            self.metadata.stale = false;
        }
        self.metadata.write_seq = seq;
        self
    }

    /// A fetch failed; previous data is retained
    pub fn fetch_failed(mut self, error: SyncError, seq: u64) -> Self {
        self.error = Some(error);
        self.status = EntryStatus::Error;
        self.metadata.in_flight = false;
        self.metadata.write_seq = seq;
        self
    }

    /// A fetch settled but its result was superseded by a newer write
    pub fn fetch_superseded(mut self) -> Self {
        self.metadata.in_flight = false;
        if self.status.is_fetching() {
            self.status = if self.data.is_some() {
                EntryStatus::Success
            } else {
                EntryStatus::Idle
            };
        }
        self
    }

    /// Mark the entry stale so the next trigger refetches regardless of
    /// throttle. `seq` must be allocated when the invalidation happens.
    pub fn invalidated(mut self, seq: u64) -> Self {
        self.metadata.stale = true;
        self.metadata.stale_seq = seq;
        self
    }

    /// Lightweight read-only view for consumers
    pub fn view(&self) -> EntryView {
        EntryView {
            data: self.data.clone(),
            error: self.error.clone(),
            status: self.status,
        }
    }
}

/// What a consumer renders: data, error and status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryView {
    pub data: Option<Value>,
    pub error: Option<SyncError>,
    pub status: EntryStatus,
}

impl EntryView {
    /// Whether the consumer should show a loading placeholder
    pub fn is_loading(&self) -> bool {
        self.status == EntryStatus::Loading
    }

    /// Whether the consumer is seeing data that is being refreshed
    pub fn is_validating(&self) -> bool {
        self.status.is_fetching()
    }
}
