//! Operation registry.
//!
//! Operations are grouped into capability sets, each a static table of
//! `(name, handler)` pairs. A registry is built once from an ordered list of
//! sets, ancestors first; a later set that reuses a name replaces the earlier
//! handler.

use super::args::CallArgs;
use super::Session;
use crate::codec::Payload;
use crate::error::Result;
use crate::value::Value;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tracing::debug;

/// Reply of a dispatched operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Unit,
    Json(JsonValue),
    Payload(Payload),
}

impl Reply {
    /// Wrap a value as an opaque payload reply.
    pub fn payload(value: &Value) -> Result<Self> {
        Ok(Reply::Payload(Payload::from_value(value)?))
    }

    /// JSON form returned to text transports.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Reply::Unit => JsonValue::Null,
            Reply::Json(value) => value.clone(),
            Reply::Payload(payload) => serde_json::json!({ "payload": payload.to_base64() }),
        }
    }

    /// Decode a payload reply back into a value.
    pub fn to_value(&self) -> Option<Result<Value>> {
        match self {
            Reply::Payload(payload) => Some(payload.to_value()),
            _ => None,
        }
    }
}

pub type Handler = fn(&mut Session, &CallArgs) -> Result<Reply>;

pub type CapabilitySet = &'static [(&'static str, Handler)];

#[derive(Debug, Clone, Default)]
pub struct Registry {
    handlers: HashMap<&'static str, Handler>,
}

impl Registry {
    pub fn from_sets(sets: &[CapabilitySet]) -> Self {
        let mut handlers = HashMap::new();
        for set in sets {
            for (name, handler) in set.iter() {
                if handlers.insert(*name, *handler).is_some() {
                    debug!("Operation {} overridden by a derived capability set", name);
                }
            }
        }
        Self { handlers }
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
