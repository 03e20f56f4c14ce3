//! Statistics for cache synchronization

use serde::{Deserialize, Serialize};
use std::fmt;

/// Counters describing how the engine has been used
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Fetches actually sent to the fetcher
    pub fetches_started: u64,

    /// Fetch requests that joined an in-flight fetch instead
    pub fetches_deduplicated: u64,

    /// Fetches that ended in an error (after retries)
    pub fetch_failures: u64,

    /// Completions dropped because a newer write had already landed
    pub stale_writes_ignored: u64,

    /// Triggers skipped by policy or throttle
    pub revalidations_skipped: u64,

    /// Mutations confirmed by the server
    pub mutations_confirmed: u64,

    /// Mutations rolled back after a failed remote write
    pub mutations_rolled_back: u64,

    /// Entries evicted after their grace period
    pub evictions: u64,

    /// Entries invalidated (manual or realtime)
    pub invalidations: u64,

    /// Realtime events that patched an entry in place
    pub realtime_patches: u64,

    /// Realtime events ignored because they originated locally
    pub echoes_suppressed: u64,
}

impl SyncStats {
    /// Share of fetch requests served by an already running fetch, as a percentage
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.fetches_started + self.fetches_deduplicated;
        if total == 0 {
            0.0
        } else {
            (self.fetches_deduplicated as f64 / total as f64) * 100.0
        }
    }

    /// Share of started fetches that failed, as a percentage
    pub fn failure_rate(&self) -> f64 {
        if self.fetches_started == 0 {
            0.0
        } else {
            (self.fetch_failures as f64 / self.fetches_started as f64) * 100.0
        }
    }
}

impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncStats {{ fetches: {}, deduplicated: {}, dedup_ratio: {:.2}%, failures: {}, stale_ignored: {}, mutations: {}/{} confirmed/rolled back, evictions: {} }}",
            self.fetches_started,
            self.fetches_deduplicated,
            self.dedup_ratio(),
            self.fetch_failures,
            self.stale_writes_ignored,
            self.mutations_confirmed,
            self.mutations_rolled_back,
            self.evictions
        )
    }
}
