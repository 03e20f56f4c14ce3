//! Canonical cache keys for resource descriptors
//!
//! A [`Descriptor`] names a remote resource (path + query parameters). The
//! serializer turns it into a [`CacheKey`] so that two descriptors with the
//! same path and the same parameters produce the same key, whatever order the
//! parameters were inserted in.
//!
//! Encoding:
//! - no parameters: the path alone (`/campaigns`)
//! - otherwise: `path?` followed by the parameters as JSON with object keys
//!   sorted recursively (`/campaigns?{"page":2,"status":"active"}`)
//!
//! Lists keep their element order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque, canonical cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// The canonical string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The resource path part of the key (everything before the parameters)
    pub fn path(&self) -> &str {
        match self.0.find('?') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Structured request descriptor: a path plus named query parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

impl Descriptor {
    /// Create a descriptor for a path with no parameters
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Canonical key for this descriptor, `None` when the path is empty or
    /// holds a `?`
    pub fn key(&self) -> Option<CacheKey> {
        serialize(Some(self))
    }
}

/// Serialize a descriptor into its canonical key.
///
/// `None` (a disabled subscription) and descriptors with an empty path yield
/// `None`; such requests never reach the store. So do paths containing `?`:
/// query parameters belong in `params`, and the first `?` of a key marks
/// where they start.
pub fn serialize(descriptor: Option<&Descriptor>) -> Option<CacheKey> {
    let descriptor = descriptor?;
    let path = descriptor.path.trim();
    if path.is_empty() || path.contains('?') {
        return None;
    }

    if descriptor.params.is_empty() {
        return Some(CacheKey(path.to_string()));
    }

    let mut key = String::with_capacity(path.len() + 32);
    key.push_str(path);
    key.push('?');
    key.push('{');
    for (i, (name, value)) in descriptor.params.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        write_json_string(name, &mut key);
        key.push(':');
        write_canonical(value, &mut key);
    }
    key.push('}');

    Some(CacheKey(key))
}

/// Serialize a loosely typed descriptor (`null`, `false`, or
/// `{"path": ..., "params": {...}}`).
///
/// Falsy and malformed input yield `None`.
pub fn serialize_value(value: &Value) -> Option<CacheKey> {
    let descriptor = descriptor_from_value(value)?;
    serialize(Some(&descriptor))
}

/// Decode a loosely typed descriptor, rejecting falsy and malformed shapes
pub fn descriptor_from_value(value: &Value) -> Option<Descriptor> {
    let object = value.as_object()?;
    let path = object.get("path")?.as_str()?;

    let mut descriptor = Descriptor::new(path);
    match object.get("params") {
        None | Some(Value::Null) => {}
        Some(Value::Object(params)) => {
            for (name, value) in params {
                descriptor.params.insert(name.clone(), value.clone());
            }
        }
        Some(_) => return None,
    }

    Some(descriptor)
}

fn write_json_string(s: &str, out: &mut String) {
    // Value::String's Display produces a correctly escaped JSON string
    out.push_str(&Value::String(s.to_string()).to_string());
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (name, value)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(name, out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
