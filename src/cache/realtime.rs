//! Realtime push events into cache updates
//!
//! Socket notifications name a resource (`campaign` 42) rather than a cache
//! key. Routes map resource types to the paths they are cached under; the
//! bridge then either patches the item entry in place (full payload) or
//! invalidates it, and always invalidates the collections listing that
//! resource type. Events caused by the local actor are dropped: the local
//! mutation already updated the cache optimistically.

use crate::cache::{
    invalidation::{InvalidationEvent, InvalidationReason},
    key::{CacheKey, Descriptor},
    revalidate::RevalidationController,
    store::CacheStore,
};
use crate::error::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// What happened to the resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeKind {
    Created,
    Updated,
    StatusChanged,
    Deleted,
    /// Any kind this client does not know about
    Other(String),
}

impl From<String> for ChangeKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "created" => ChangeKind::Created,
            "updated" => ChangeKind::Updated,
            "statusChanged" => ChangeKind::StatusChanged,
            "deleted" => ChangeKind::Deleted,
            _ => ChangeKind::Other(kind),
        }
    }
}

impl From<ChangeKind> for String {
    fn from(kind: ChangeKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::StatusChanged => write!(f, "statusChanged"),
            ChangeKind::Deleted => write!(f, "deleted"),
            ChangeKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// Inbound push notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    pub resource_type: String,

    #[serde(deserialize_with = "string_or_number")]
    pub resource_id: String,

    pub change_kind: ChangeKind,

    /// Who caused the change
    #[serde(default)]
    pub actor_id: Option<String>,

    /// Updated resource, when the channel sends it
    #[serde(default)]
    pub payload: Option<Value>,

    /// The payload only carries the changed fields
    #[serde(default)]
    pub partial: bool,
}

impl RealtimeEvent {
    /// Event without payload
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        change_kind: ChangeKind,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            change_kind,
            actor_id: None,
            payload: None,
            partial: false,
        }
    }

    /// Record the user who made the change, for echo suppression
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Attach the full updated resource
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self.partial = false;
        self
    }

    /// Attach a payload holding only the changed fields
    pub fn with_partial_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self.partial = true;
        self
    }

    /// Full replacement data, if the event carries it
    fn full_payload(&self) -> Option<&Value> {
        if self.partial || self.change_kind == ChangeKind::Deleted {
            return None;
        }
        self.payload.as_ref()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "resourceId must be a string or number, got {}",
            other
        ))),
    }
}

/// Where a resource type is cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRoute {
    pub resource_type: String,

    /// Item path with an `{id}` placeholder, e.g. `/campaigns/{id}`
    pub item_path: String,

    /// Paths of lists containing this resource type; every cached key under
    /// these paths is invalidated, whatever its params
    pub collection_paths: Vec<String>,
}

impl ResourceRoute {
    /// Route `resource_type` to its item path, with no collections yet
    pub fn new(resource_type: impl Into<String>, item_path: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            item_path: item_path.into(),
            collection_paths: Vec::new(),
        }
    }

    /// Add a collection path
    pub fn with_collection(mut self, path: impl Into<String>) -> Self {
        self.collection_paths.push(path.into());
        self
    }

    /// Descriptor of the item with `id`
    pub fn item_descriptor(&self, id: &str) -> Descriptor {
        Descriptor::new(self.item_path.replace("{id}", id))
    }
}

/// What the bridge did with an event
#[derive(Debug, Clone)]
pub enum RealtimeOutcome {
    /// The local actor caused the change; nothing to do
    EchoSuppressed,

    /// The item entry was patched; collections were invalidated
    Patched {
        key: CacheKey,
        invalidated: InvalidationEvent,
    },

    /// Affected entries were invalidated
    Invalidated(InvalidationEvent),

    /// No route for the resource type
    Unrouted,
}

impl RealtimeOutcome {
    /// Keys whose entries changed
    pub fn affected_keys(&self) -> Vec<CacheKey> {
        match self {
            RealtimeOutcome::Patched { key, invalidated } => {
                let mut keys = vec![key.clone()];
                keys.extend(invalidated.keys.iter().cloned());
                keys
            }
            RealtimeOutcome::Invalidated(event) => event.keys.clone(),
            RealtimeOutcome::EchoSuppressed | RealtimeOutcome::Unrouted => Vec::new(),
        }
    }
}

/// Applies realtime events to the cache
pub struct RealtimeBridge {
    store: CacheStore,
    controller: Arc<RevalidationController>,
    local_actor_id: RwLock<Option<String>>,
    routes: RwLock<HashMap<String, ResourceRoute>>,
}

impl RealtimeBridge {
    /// Create a bridge; events from `local_actor_id` are suppressed
    pub fn new(
        store: CacheStore,
        controller: Arc<RevalidationController>,
        local_actor_id: Option<String>,
    ) -> Self {
        Self {
            store,
            controller,
            local_actor_id: RwLock::new(local_actor_id),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the route of a resource type
    pub fn register(&self, route: ResourceRoute) {
        info!(
            "Registered realtime route: {} -> {}",
            route.resource_type, route.item_path
        );
        self.routes
            .write()
            .insert(route.resource_type.clone(), route);
    }

    /// Change the local actor (login, account switch)
    pub fn set_local_actor_id(&self, actor_id: Option<String>) {
        *self.local_actor_id.write() = actor_id;
    }

    /// Apply one event
    pub fn handle_event(&self, event: &RealtimeEvent) -> RealtimeOutcome {
        if self.is_echo(event) {
            debug!(
                "Suppressed echo of local change: {}/{}",
                event.resource_type, event.resource_id
            );
            self.store.record(|s| s.echoes_suppressed += 1);
            return RealtimeOutcome::EchoSuppressed;
        }

        let Some(route) = self.routes.read().get(&event.resource_type).cloned() else {
            debug!("No realtime route for resource type: {}", event.resource_type);
            return RealtimeOutcome::Unrouted;
        };

        let reason = InvalidationReason::Realtime {
            resource_type: event.resource_type.clone(),
            resource_id: event.resource_id.clone(),
        };
        let item_key = route.item_descriptor(&event.resource_id).key();

        let mut invalidated = Vec::new();
        let mut patched = None;

        if let Some(key) = item_key {
            match event.full_payload() {
                Some(payload) if self.controller.patch(&key, payload.clone()) => {
                    self.store.record(|s| s.realtime_patches += 1);
                    patched = Some(key);
                }
                _ => {
                    if self.controller.invalidate(&key) {
                        invalidated.push(key);
                    }
                }
            }
        }

        for key in self.collection_keys(&route) {
            if self.controller.invalidate(&key) {
                invalidated.push(key);
            }
        }

        let event_record = InvalidationEvent::new(reason, invalidated)
            .with_context(format!("change kind: {}", event.change_kind));

        debug!(
            "Realtime {} for {}/{}: patched={}, invalidated={}",
            event.change_kind,
            event.resource_type,
            event.resource_id,
            patched.is_some(),
            event_record.keys.len()
        );

        match patched {
            Some(key) => RealtimeOutcome::Patched {
                key,
                invalidated: event_record,
            },
            None => RealtimeOutcome::Invalidated(event_record),
        }
    }

    /// Decode a raw channel message and apply it
    pub fn handle_json(&self, message: &Value) -> Result<RealtimeOutcome> {
        let event: RealtimeEvent = serde_json::from_value(message.clone())?;
        Ok(self.handle_event(&event))
    }

    fn is_echo(&self, event: &RealtimeEvent) -> bool {
        match (self.local_actor_id.read().as_deref(), event.actor_id.as_deref()) {
            (Some(local), Some(actor)) => local == actor,
            _ => false,
        }
    }

    fn collection_keys(&self, route: &ResourceRoute) -> Vec<CacheKey> {
        if route.collection_paths.is_empty() {
            return Vec::new();
        }

        self.store
            .keys()
            .into_iter()
            .filter(|key| route.collection_paths.iter().any(|path| path == key.path()))
            .collect()
    }
}
