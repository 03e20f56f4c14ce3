//! Resource fetchers
//!
//! The cache core never talks to the network itself. It calls a
//! [`ResourceFetcher`] supplied by the host, which is expected to hand back
//! data in one canonical shape; [`normalize_response`] folds the envelope
//! variants the campaign API returns into that shape.

use crate::cache::key::Descriptor;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Loads the current value of a resource
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch the resource described by `descriptor`
    async fn fetch(&self, descriptor: &Descriptor) -> Result<Value>;
}

/// Unwrap the response envelopes used by the campaign API.
///
/// - `{"success": true, "data": X}` and `{"data": X}` yield `X`
/// - `{"success": false, "message": M}` is an error carrying `M`
/// - anything else is returned unchanged
pub fn normalize_response(body: Value) -> Result<Value> {
    let mut map = match body {
        Value::Object(map) => map,
        other => return Ok(other),
    };

    if let Some(Value::Bool(false)) = map.get("success") {
        let message = map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("request was not successful")
            .to_string();
        return Err(anyhow!(message));
    }

    let enveloped = map.contains_key("data")
        && map
            .keys()
            .all(|k| matches!(k.as_str(), "data" | "success" | "message" | "meta"));
    if enveloped {
        return Ok(map.remove("data").unwrap_or(Value::Null));
    }

    Ok(Value::Object(map))
}

/// Fetcher issuing `GET {base_url}{path}` with the descriptor's params as
/// query string
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    base_url: String,
}

impl HttpFetcher {
    /// Create a fetcher for `base_url` (e.g. `https://api.example.com/v1`)
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    /// Create a fetcher whose requests give up after `timeout`
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Full URL for a descriptor path
    pub fn url_for(&self, descriptor: &Descriptor) -> String {
        format!("{}{}", self.base_url, descriptor.path)
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, descriptor: &Descriptor) -> Result<Value> {
        let url = self.url_for(descriptor);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .query(&query_pairs(descriptor))
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Request to {} was rejected", url))?;

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Invalid JSON from {}", url))?;

        normalize_response(body)
    }
}

/// Flatten params into query pairs: arrays repeat their name, nulls are
/// dropped, objects are sent as JSON.
pub fn query_pairs(descriptor: &Descriptor) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (name, value) in &descriptor.params {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    if let Some(rendered) = render_scalar(item) {
                        pairs.push((name.clone(), rendered));
                    }
                }
            }
            other => {
                if let Some(rendered) = render_scalar(other) {
                    pairs.push((name.clone(), rendered));
                }
            }
        }
    }
    pairs
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Fetcher backed by a closure, for hosts with their own transport
pub struct FnFetcher<F> {
    func: F,
}

/// Wrap `func` as a [`ResourceFetcher`]
pub fn from_fn<F, Fut>(func: F) -> FnFetcher<F>
where
    F: Fn(&Descriptor) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    FnFetcher { func }
}

#[async_trait]
impl<F, Fut> ResourceFetcher for FnFetcher<F>
where
    F: Fn(&Descriptor) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn fetch(&self, descriptor: &Descriptor) -> Result<Value> {
        (self.func)(descriptor).await
    }
}
