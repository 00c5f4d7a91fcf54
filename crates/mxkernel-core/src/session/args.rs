//! Call arguments of a dispatched operation.
//!
//! Front ends send parameters either positionally (a JSON array) or by
//! keyword (a JSON object). Handlers ask for each parameter by position and
//! name; a keyword entry wins over the positional one. JSON `null` counts as
//! absent.

use crate::codec::Payload;
use crate::error::{KernelError, Result};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    positional: Vec<JsonValue>,
    named: Map<String, JsonValue>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from JSON-RPC `params`.
    pub fn from_params(params: Option<JsonValue>) -> Result<Self> {
        match params {
            None | Some(JsonValue::Null) => Ok(Self::new()),
            Some(JsonValue::Array(values)) => Ok(Self::positional(values)),
            Some(JsonValue::Object(map)) => Ok(Self {
                positional: Vec::new(),
                named: map,
            }),
            Some(other) => Err(KernelError::InvalidParams {
                message: format!("params must be an array or an object, got {}", other),
            }),
        }
    }

    pub fn positional(values: impl IntoIterator<Item = JsonValue>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            named: Map::new(),
        }
    }

    /// Add a keyword argument.
    pub fn with(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.named.insert(name.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    pub fn get(&self, index: usize, name: &str) -> Option<&JsonValue> {
        self.named
            .get(name)
            .or_else(|| self.positional.get(index))
            .filter(|v| !v.is_null())
    }

    pub fn get_str(&self, index: usize, name: &str) -> Result<Option<&str>> {
        match self.get(index, name) {
            None => Ok(None),
            Some(JsonValue::String(s)) => Ok(Some(s)),
            Some(other) => Err(wrong_type(name, "a string", other)),
        }
    }

    /// String parameter where an empty or blank string means absent.
    pub fn get_nonblank(&self, index: usize, name: &str) -> Result<Option<&str>> {
        Ok(self.get_str(index, name)?.filter(|s| !s.trim().is_empty()))
    }

    pub fn require_str(&self, index: usize, name: &str) -> Result<&str> {
        self.get_str(index, name)?.ok_or_else(|| missing(name))
    }

    /// Bool parameter, `false` when absent.
    pub fn get_bool(&self, index: usize, name: &str) -> Result<bool> {
        match self.get(index, name) {
            None => Ok(false),
            Some(JsonValue::Bool(b)) => Ok(*b),
            Some(JsonValue::Number(n)) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
            Some(other) => Err(wrong_type(name, "a bool", other)),
        }
    }

    pub fn get_str_list(&self, index: usize, name: &str) -> Result<Option<Vec<String>>> {
        match self.get(index, name) {
            None => Ok(None),
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(String::from)
                        .ok_or_else(|| wrong_type(name, "a list of strings", item))
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(JsonValue::String(s)) => Ok(Some(vec![s.clone()])),
            Some(other) => Err(wrong_type(name, "a list of strings", other)),
        }
    }

    /// Opaque payload sent as a base64 string.
    pub fn require_payload(&self, index: usize, name: &str) -> Result<Payload> {
        let text = self.require_str(index, name)?;
        Payload::from_base64(text)
    }
}

fn missing(name: &str) -> KernelError {
    KernelError::InvalidParams {
        message: format!("Missing required parameter: {}", name),
    }
}

fn wrong_type(name: &str, expected: &str, got: &JsonValue) -> KernelError {
    KernelError::InvalidParams {
        message: format!("Parameter {} must be {}, got {}", name, expected, got),
    }
}
