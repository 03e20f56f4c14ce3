//! Invalidation and eviction records
//!
//! Every path that drops or stales entries reports what it did as an
//! [`InvalidationEvent`], so hosts can log or assert on it.

use crate::cache::key::CacheKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason for invalidating or evicting entries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Explicit `invalidate(key)` call
    Manual,

    /// Realtime push for a resource changed by another actor
    Realtime {
        resource_type: String,
        resource_id: String,
    },

    /// Zero-subscriber entry outlived its grace period
    GracePeriodElapsed,

    /// Global clear (logout, test isolation)
    Cleared,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::Realtime {
                resource_type,
                resource_id,
            } => write!(f, "realtime change: {}/{}", resource_type, resource_id),
            InvalidationReason::GracePeriodElapsed => write!(f, "grace period elapsed"),
            InvalidationReason::Cleared => write!(f, "cache cleared"),
        }
    }
}

/// Record of an invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Keys that were invalidated
    pub keys: Vec<CacheKey>,

    /// Additional context
    pub context: Option<String>,
}

impl InvalidationEvent {
    /// Create a new invalidation event
    pub fn new(reason: InvalidationReason, keys: Vec<CacheKey>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            keys,
            context: None,
        }
    }

    /// Add context to the event
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Whether any key was affected
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::Descriptor;

    #[test]
    fn test_invalidation_reason_display() {
        assert_eq!(InvalidationReason::Manual.to_string(), "manual invalidation");

        let reason = InvalidationReason::Realtime {
            resource_type: "campaign".to_string(),
            resource_id: "42".to_string(),
        };
        assert_eq!(reason.to_string(), "realtime change: campaign/42");
    }

    #[test]
    fn test_invalidation_event() {
        let key = Descriptor::new("/campaigns/42").key().unwrap();
        let event = InvalidationEvent::new(InvalidationReason::Manual, vec![key.clone()])
            .with_context("toolbar refresh");

        assert_eq!(event.keys, vec![key]);
        assert_eq!(event.context.as_deref(), Some("toolbar refresh"));
        assert!(!event.is_empty());
        assert!(InvalidationEvent::new(InvalidationReason::Cleared, vec![]).is_empty());
    }
}
