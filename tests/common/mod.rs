//! Shared fixtures for the integration tests

use anyhow::anyhow;
use async_trait::async_trait;
use campaign_sync::{Descriptor, ResourceFetcher};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// In-memory fetcher answering per path, with a fixed latency.
///
/// The answer is picked when the request is made; changes to the configured
/// responses only affect later requests.
pub struct TestFetcher {
    latency: Duration,
    calls: AtomicUsize,
    per_path_calls: Mutex<HashMap<String, usize>>,
    queued: Mutex<HashMap<String, VecDeque<anyhow::Result<Value>>>>,
    standing: Mutex<HashMap<String, Value>>,
}

#[allow(dead_code)]
impl TestFetcher {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            calls: AtomicUsize::new(0),
            per_path_calls: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            standing: Mutex::new(HashMap::new()),
        }
    }

    /// Answer every fetch of `path` with `value`
    pub fn respond(&self, path: &str, value: Value) {
        self.standing.lock().insert(path.to_string(), value);
    }

    /// Answer the next fetch of `path` with `result`, ahead of the standing answer
    pub fn enqueue(&self, path: &str, result: anyhow::Result<Value>) {
        self.queued
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.per_path_calls.lock().get(path).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ResourceFetcher for TestFetcher {
    async fn fetch(&self, descriptor: &Descriptor) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_path_calls
            .lock()
            .entry(descriptor.path.clone())
            .or_default() += 1;

        // Response is fixed when the request is made
        let queued = self
            .queued
            .lock()
            .get_mut(&descriptor.path)
            .and_then(VecDeque::pop_front);
        let response = queued.unwrap_or_else(|| {
            self.standing
                .lock()
                .get(&descriptor.path)
                .cloned()
                .ok_or_else(|| anyhow!("no response configured for {}", descriptor.path))
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        response
    }
}

/// Append `item` to an array (or start one)
#[allow(dead_code)]
pub fn append(item: Value) -> impl Fn(Option<&Value>) -> Value + Send + Sync + 'static {
    move |data| {
        let mut items = data.and_then(|v| v.as_array().cloned()).unwrap_or_default();
        items.push(item.clone());
        Value::Array(items)
    }
}

/// Let spawned tasks run until `done` holds (bounded)
#[allow(dead_code)]
pub async fn settle<F: Fn() -> bool>(done: F) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
}
