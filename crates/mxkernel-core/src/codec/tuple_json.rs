//! JSON encoding that keeps tuples distinct from lists.
//!
//! JSON has no tuple type, so each tuple is written as a tagged object:
//!
//! ```text
//! (1, [2, (3,)])  ->  {"__tuple__": true, "items": [1, [2, {"__tuple__": true, "items": [3]}]]}
//! ```
//!
//! The `__tuple__` key is reserved: mappings that use it as a key are
//! rejected on encode.

use crate::error::{KernelError, Result};
use crate::value::Value;
use serde_json::{Map, Number};
use std::collections::BTreeMap;

const TUPLE_TAG: &str = "__tuple__";
const ITEMS_KEY: &str = "items";

/// Encode a value as JSON text.
pub fn encode(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&to_json(value)?)?)
}

/// Decode JSON text, restoring tagged tuples at any depth.
pub fn decode(text: &str) -> Result<Value> {
    let json: serde_json::Value = serde_json::from_str(text).map_err(|e| KernelError::Parse {
        message: format!("malformed JSON: {}", e),
    })?;
    Ok(from_json(json))
}

/// Convert a value to its JSON form.
pub fn to_json(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| unsupported(value))?,
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(items_to_json(items)?),
        Value::Tuple(items) => {
            let mut tagged = Map::new();
            tagged.insert(TUPLE_TAG.to_string(), serde_json::Value::Bool(true));
            tagged.insert(ITEMS_KEY.to_string(), serde_json::Value::Array(items_to_json(items)?));
            serde_json::Value::Object(tagged)
        }
        Value::Dict(map) => {
            if map.contains_key(TUPLE_TAG) {
                return Err(KernelError::Serialization {
                    message: format!("mapping key {} is reserved", TUPLE_TAG),
                });
            }
            let mut object = Map::new();
            for (key, item) in map {
                object.insert(key.clone(), to_json(item)?);
            }
            serde_json::Value::Object(object)
        }
        Value::Set(_)
        | Value::Object(_)
        | Value::Module(_)
        | Value::Resource(_)
        | Value::Foreign(_) => return Err(unsupported(value)),
    })
}

/// Convert JSON to a value, recognizing tagged tuples bottom-up.
pub fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(mut object) => {
            if is_tuple_tag(&object) {
                if let Some(serde_json::Value::Array(items)) = object.remove(ITEMS_KEY) {
                    return Value::Tuple(items.into_iter().map(from_json).collect());
                }
            }
            let map: BTreeMap<String, Value> = object
                .into_iter()
                .map(|(key, item)| (key, from_json(item)))
                .collect();
            Value::Dict(map)
        }
    }
}

fn is_tuple_tag(object: &Map<String, serde_json::Value>) -> bool {
    object.len() == 2
        && object.get(TUPLE_TAG) == Some(&serde_json::Value::Bool(true))
        && matches!(object.get(ITEMS_KEY), Some(serde_json::Value::Array(_)))
}

fn items_to_json(items: &[Value]) -> Result<Vec<serde_json::Value>> {
    items.iter().map(to_json).collect()
}

fn unsupported(value: &Value) -> KernelError {
    KernelError::Serialization {
        message: format!("{} has no JSON form: {}", value.type_name(), value.repr()),
    }
}
