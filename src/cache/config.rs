//! Configuration for the synchronization engine
//!
//! Two layers:
//! - [`SyncConfig`]: process-wide settings (eviction grace period, cleanup
//!   cadence, local actor identity, default policy)
//! - [`RevalidationPolicy`]: per-subscription revalidation triggers, throttle,
//!   retries and timeout

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-subscription revalidation policy
///
/// Every trigger is independently switchable so call sites can describe
/// their resource: immutable lookups never revalidate, dashboards refresh on
/// focus, live counters poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevalidationPolicy {
    /// Revalidate cached data when a new subscription mounts
    pub on_mount: bool,

    /// Revalidate when the host window regains focus
    pub on_focus: bool,

    /// Revalidate when the network reconnects
    pub on_reconnect: bool,

    /// Poll while subscribed
    pub poll_interval: Option<Duration>,

    /// Poll interval jitter factor (0.0 - 1.0)
    /// Spreads pollers that subscribed at the same moment
    pub poll_jitter: f64,

    /// Minimum time between two fetches of the same key (zero = no throttle)
    pub dedupe_interval: Duration,

    /// Retry failed fetches
    pub retry_on_error: bool,

    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Delay between retry attempts
    pub retry_delay: Duration,

    /// Treat fetches slower than this as failed
    pub fetch_timeout: Option<Duration>,
}

impl Default for RevalidationPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RevalidationPolicy {
    /// Create a new builder starting from the standard policy
    pub fn builder() -> RevalidationPolicyBuilder {
        RevalidationPolicyBuilder::default()
    }

    /// Revalidate on mount, focus and reconnect, no throttle, no retries
    pub fn standard() -> Self {
        Self {
            on_mount: true,
            on_focus: true,
            on_reconnect: true,
            poll_interval: None,
            poll_jitter: 0.0,
            dedupe_interval: Duration::ZERO,
            retry_on_error: false,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            fetch_timeout: None,
        }
    }

    /// Fetch once, never revalidate automatically
    pub fn immutable() -> Self {
        Self {
            on_mount: false,
            on_focus: false,
            on_reconnect: false,
            ..Self::standard()
        }
    }

    /// Poll at a fixed interval in addition to the standard triggers
    pub fn polling(interval: Duration) -> Self {
        Self {
            poll_interval: Some(interval),
            poll_jitter: 0.1,
            ..Self::standard()
        }
    }

    /// Only explicit revalidation and invalidation refetch
    pub fn manual() -> Self {
        Self {
            on_mount: false,
            on_focus: false,
            on_reconnect: false,
            poll_interval: None,
            ..Self::standard()
        }
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if let Some(interval) = self.poll_interval {
            if interval.is_zero() {
                return Err(SyncError::ConfigError(
                    "poll_interval must be greater than 0".to_string(),
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.poll_jitter) {
            return Err(SyncError::ConfigError(
                "poll_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if let Some(timeout) = self.fetch_timeout {
            if timeout.is_zero() {
                return Err(SyncError::ConfigError(
                    "fetch_timeout must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Number of attempts a fetch gets (first try plus retries)
    pub fn attempts(&self) -> u32 {
        if self.retry_on_error {
            self.max_retries + 1
        } else {
            1
        }
    }

    /// Calculate the next poll delay with jitter applied
    pub fn poll_delay_with_jitter(&self) -> Option<Duration> {
        let interval = self.poll_interval?;
        if self.poll_jitter == 0.0 {
            return Some(interval);
        }

        let base_ms = interval.as_secs_f64() * 1000.0;
        let jitter_range = base_ms * self.poll_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_ms = (base_ms + jitter).max(1.0);

        Some(Duration::from_secs_f64(final_ms / 1000.0))
    }
}

/// Builder for revalidation policies
#[derive(Debug, Default)]
pub struct RevalidationPolicyBuilder {
    on_mount: Option<bool>,
    on_focus: Option<bool>,
    on_reconnect: Option<bool>,
    poll_interval: Option<Duration>,
    poll_jitter: Option<f64>,
    dedupe_interval: Option<Duration>,
    retry_on_error: Option<bool>,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    fetch_timeout: Option<Duration>,
}

impl RevalidationPolicyBuilder {
    pub fn on_mount(mut self, enable: bool) -> Self {
        self.on_mount = Some(enable);
        self
    }

    pub fn on_focus(mut self, enable: bool) -> Self {
        self.on_focus = Some(enable);
        self
    }

    pub fn on_reconnect(mut self, enable: bool) -> Self {
        self.on_reconnect = Some(enable);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn poll_jitter(mut self, jitter: f64) -> Self {
        self.poll_jitter = Some(jitter);
        self
    }

    pub fn dedupe_interval(mut self, interval: Duration) -> Self {
        self.dedupe_interval = Some(interval);
        self
    }

    /// Enable retries with the given attempt budget and delay
    pub fn retry_on_error(mut self, max_retries: u32, delay: Duration) -> Self {
        self.retry_on_error = Some(true);
        self.max_retries = Some(max_retries);
        self.retry_delay = Some(delay);
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Build the policy
    pub fn build(self) -> RevalidationPolicy {
        let defaults = RevalidationPolicy::standard();

        RevalidationPolicy {
            on_mount: self.on_mount.unwrap_or(defaults.on_mount),
            on_focus: self.on_focus.unwrap_or(defaults.on_focus),
            on_reconnect: self.on_reconnect.unwrap_or(defaults.on_reconnect),
            poll_interval: self.poll_interval.or(defaults.poll_interval),
            poll_jitter: self.poll_jitter.unwrap_or(defaults.poll_jitter),
            dedupe_interval: self.dedupe_interval.unwrap_or(defaults.dedupe_interval),
            retry_on_error: self.retry_on_error.unwrap_or(defaults.retry_on_error),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            fetch_timeout: self.fetch_timeout.or(defaults.fetch_timeout),
        }
    }
}

/// Process-wide configuration for the sync engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long a zero-subscriber entry survives before eviction
    pub grace_period: Duration,

    /// Enable the background sweeper for idle entries
    pub enable_auto_cleanup: bool,

    /// Interval for the background sweeper
    pub cleanup_interval: Duration,

    /// Identity of the local actor, used for realtime echo suppression
    pub local_actor_id: Option<String>,

    /// Policy applied by `use_entry` when the caller passes none
    pub default_policy: RevalidationPolicy,

    /// Enable statistics collection
    pub enable_metrics: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            // 5 minutes keeps entries around across typical page switches
            grace_period: Duration::from_secs(300),
            enable_auto_cleanup: true,
            cleanup_interval: Duration::from_secs(60),
            local_actor_id: None,
            default_policy: RevalidationPolicy::standard(),
            enable_metrics: true,
        }
    }
}

impl SyncConfig {
    /// Create a new builder for the configuration
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.enable_auto_cleanup && self.cleanup_interval.is_zero() {
            return Err(SyncError::ConfigError(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }

        if let Some(actor) = &self.local_actor_id {
            if actor.trim().is_empty() {
                return Err(SyncError::ConfigError(
                    "local_actor_id must not be empty".to_string(),
                ));
            }
        }

        self.default_policy.validate()
    }

    /// Load configuration from the environment (and a `.env` file if present)
    ///
    /// Recognised variables:
    /// - `CAMPAIGN_SYNC_GRACE_PERIOD_MS`
    /// - `CAMPAIGN_SYNC_CLEANUP_INTERVAL_MS`
    /// - `CAMPAIGN_SYNC_DEDUPE_INTERVAL_MS`
    /// - `CAMPAIGN_SYNC_FETCH_TIMEOUT_MS`
    /// - `CAMPAIGN_SYNC_ACTOR_ID`
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |name: &str| -> Result<Option<Duration>> {
            match lookup(name) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(|ms| Some(Duration::from_millis(ms)))
                    .map_err(|e| SyncError::ConfigError(format!("{}: {}", name, e))),
            }
        };

        let mut builder = SyncConfig::builder();
        let mut policy = RevalidationPolicy::standard();

        if let Some(grace) = millis("CAMPAIGN_SYNC_GRACE_PERIOD_MS")? {
            builder = builder.grace_period(grace);
        }
        if let Some(interval) = millis("CAMPAIGN_SYNC_CLEANUP_INTERVAL_MS")? {
            builder = builder.cleanup_interval(interval);
        }
        if let Some(dedupe) = millis("CAMPAIGN_SYNC_DEDUPE_INTERVAL_MS")? {
            policy.dedupe_interval = dedupe;
        }
        if let Some(timeout) = millis("CAMPAIGN_SYNC_FETCH_TIMEOUT_MS")? {
            policy.fetch_timeout = Some(timeout);
        }
        if let Some(actor) = lookup("CAMPAIGN_SYNC_ACTOR_ID") {
            builder = builder.local_actor_id(actor);
        }

        let config = builder.default_policy(policy).build();
        config.validate()?;
        Ok(config)
    }
}

/// Builder for the sync configuration
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    grace_period: Option<Duration>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
    local_actor_id: Option<String>,
    default_policy: Option<RevalidationPolicy>,
    enable_metrics: Option<bool>,
}

impl SyncConfigBuilder {
    /// Set the eviction grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    /// Enable or disable the background sweeper
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set the sweeper interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Set the local actor id used for echo suppression
    pub fn local_actor_id(mut self, actor: impl Into<String>) -> Self {
        self.local_actor_id = Some(actor.into());
        self
    }

    /// Set the default revalidation policy
    pub fn default_policy(mut self, policy: RevalidationPolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    /// Enable or disable statistics collection
    pub fn enable_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = Some(enable);
        self
    }

    /// Build the configuration
    pub fn build(self) -> SyncConfig {
        let defaults = SyncConfig::default();

        SyncConfig {
            grace_period: self.grace_period.unwrap_or(defaults.grace_period),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
            local_actor_id: self.local_actor_id.or(defaults.local_actor_id),
            default_policy: self.default_policy.unwrap_or(defaults.default_policy),
            enable_metrics: self.enable_metrics.unwrap_or(defaults.enable_metrics),
        }
    }
}

/// Preset configurations for common dashboards
impl SyncConfig {
    /// Admin/brand dashboards: refresh on focus, short throttle
    pub fn dashboard() -> Self {
        Self {
            default_policy: RevalidationPolicy::builder()
                .dedupe_interval(Duration::from_secs(2))
                .build(),
            ..Default::default()
        }
    }

    /// Screens fed by the realtime channel: short grace, polling fallback
    pub fn realtime() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(15),
            default_policy: RevalidationPolicy::polling(Duration::from_secs(30)),
            ..Default::default()
        }
    }

    /// Flaky networks: keep entries longer, retry and time out fetches
    pub fn offline_tolerant() -> Self {
        Self {
            grace_period: Duration::from_secs(1800),
            default_policy: RevalidationPolicy::builder()
                .retry_on_error(5, Duration::from_secs(2))
                .fetch_timeout(Duration::from_secs(10))
                .build(),
            ..Default::default()
        }
    }
}
