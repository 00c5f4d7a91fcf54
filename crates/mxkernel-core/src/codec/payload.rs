//! Opaque byte payloads for values that are not guaranteed JSON-safe.
//!
//! Snapshots, node results and value pairs may contain object handles,
//! tuples and foreign values, so handlers ship them as bincode bytes. The
//! host wraps the bytes in base64 when they ride inside a JSON reply.
//!
//! On the wire a value is flattened into pre-order nodes: each container
//! node carries its length and is followed by its items. Decoding rebuilds
//! the tree with an explicit stack, so untrusted bytes can neither recurse
//! nor nest deeper than `KernelConfig::MAX_PARSE_DEPTH`.

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::value::{ForeignValue, ObjectRef, Value};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Serialized bytes of one [`Value`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Serialize a value.
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(Self(wire_options().serialize(&flatten(value))?))
    }

    /// Deserialize the value back.
    ///
    /// Fails with a serialization error on malformed bytes, on payloads
    /// larger than `KernelConfig::MAX_PAYLOAD_BYTES` and on values nested
    /// deeper than `KernelConfig::MAX_PARSE_DEPTH`.
    pub fn to_value(&self) -> Result<Value> {
        let nodes: Vec<WireNode> = wire_options()
            .with_limit(KernelConfig::MAX_PAYLOAD_BYTES)
            .deserialize(&self.0)?;
        unflatten(nodes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self> {
        STANDARD
            .decode(text)
            .map(Self)
            .map_err(|e| KernelError::Parse {
                message: format!("invalid base64 payload: {}", e),
            })
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

/// One value in pre-order; `Dict` carries its keys, its values follow.
#[derive(Debug, Serialize, Deserialize)]
enum WireNode {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(u64),
    Tuple(u64),
    Set(u64),
    Dict(Vec<String>),
    Object(ObjectRef),
    Module(String),
    Resource(String),
    Foreign(ForeignValue),
}

fn flatten(value: &Value) -> Vec<WireNode> {
    let mut nodes = Vec::new();
    let mut pending = vec![value];

    while let Some(value) = pending.pop() {
        nodes.push(match value {
            Value::None => WireNode::None,
            Value::Bool(b) => WireNode::Bool(*b),
            Value::Int(i) => WireNode::Int(*i),
            Value::Float(f) => WireNode::Float(*f),
            Value::Str(s) => WireNode::Str(s.clone()),
            Value::List(items) => {
                pending.extend(items.iter().rev());
                WireNode::List(items.len() as u64)
            }
            Value::Tuple(items) => {
                pending.extend(items.iter().rev());
                WireNode::Tuple(items.len() as u64)
            }
            Value::Set(items) => {
                pending.extend(items.iter().rev());
                WireNode::Set(items.len() as u64)
            }
            Value::Dict(map) => {
                pending.extend(map.values().rev());
                WireNode::Dict(map.keys().cloned().collect())
            }
            Value::Object(obj) => WireNode::Object(obj.clone()),
            Value::Module(name) => WireNode::Module(name.clone()),
            Value::Resource(repr) => WireNode::Resource(repr.clone()),
            Value::Foreign(foreign) => WireNode::Foreign(foreign.clone()),
        });
    }
    nodes
}

#[derive(Debug, Clone, Copy)]
enum Shape {
    List,
    Tuple,
    Set,
    Dict,
}

/// A container whose items are still being read.
struct OpenContainer {
    shape: Shape,
    keys: Vec<String>,
    len: usize,
    items: Vec<Value>,
}

impl OpenContainer {
    fn close(self) -> Value {
        match self.shape {
            Shape::List => Value::List(self.items),
            Shape::Tuple => Value::Tuple(self.items),
            Shape::Set => Value::Set(self.items),
            Shape::Dict => Value::Dict(self.keys.into_iter().zip(self.items).collect()),
        }
    }
}

fn malformed(message: impl Into<String>) -> KernelError {
    KernelError::Serialization {
        message: message.into(),
    }
}

fn unflatten(nodes: Vec<WireNode>) -> Result<Value> {
    let mut nodes = nodes.into_iter();
    let mut open: Vec<OpenContainer> = Vec::new();

    loop {
        let node = nodes
            .next()
            .ok_or_else(|| malformed("payload ends inside a container"))?;

        let mut finished = match start(node) {
            Start::Leaf(value) => value,
            Start::Container(container) if container.len == 0 => container.close(),
            Start::Container(container) => {
                if open.len() >= KernelConfig::MAX_PARSE_DEPTH {
                    return Err(malformed(format!(
                        "payload nested deeper than {} levels",
                        KernelConfig::MAX_PARSE_DEPTH
                    )));
                }
                open.push(container);
                continue;
            }
        };

        // Hand the finished value to its parent, closing every container it
        // completes.
        loop {
            let Some(mut parent) = open.pop() else {
                if nodes.next().is_some() {
                    return Err(malformed("trailing nodes after payload value"));
                }
                return Ok(finished);
            };
            parent.items.push(finished);
            if parent.items.len() < parent.len {
                open.push(parent);
                break;
            }
            finished = parent.close();
        }
    }
}

enum Start {
    Leaf(Value),
    Container(OpenContainer),
}

fn start(node: WireNode) -> Start {
    let (shape, keys, len) = match node {
        WireNode::List(len) => (Shape::List, Vec::new(), len),
        WireNode::Tuple(len) => (Shape::Tuple, Vec::new(), len),
        WireNode::Set(len) => (Shape::Set, Vec::new(), len),
        WireNode::Dict(keys) => {
            let len = keys.len() as u64;
            (Shape::Dict, keys, len)
        }
        WireNode::None => return Start::Leaf(Value::None),
        WireNode::Bool(b) => return Start::Leaf(Value::Bool(b)),
        WireNode::Int(i) => return Start::Leaf(Value::Int(i)),
        WireNode::Float(f) => return Start::Leaf(Value::Float(f)),
        WireNode::Str(s) => return Start::Leaf(Value::Str(s)),
        WireNode::Object(obj) => return Start::Leaf(Value::Object(obj)),
        WireNode::Module(name) => return Start::Leaf(Value::Module(name)),
        WireNode::Resource(repr) => return Start::Leaf(Value::Resource(repr)),
        WireNode::Foreign(foreign) => return Start::Leaf(Value::Foreign(foreign)),
    };
    Start::Container(OpenContainer {
        shape,
        keys,
        len: usize::try_from(len).unwrap_or(usize::MAX),
        items: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ForeignValue, ObjectKind, ObjectRef, Scalar};

    #[test]
    fn test_non_json_values_survive() {
        let value = Value::List(vec![
            Value::Object(ObjectRef::new(ObjectKind::Cells, "M.S.foo")),
            Value::tuple([Value::Int(1), Value::Float(f64::INFINITY)]),
            Value::Foreign(
                ForeignValue::new("numpy", "float64", "2.0").with_scalar(Scalar::Float(2.0)),
            ),
            Value::Set(vec![Value::str("a")]),
        ]);
        let payload = Payload::from_value(&value).unwrap();
        assert_eq!(payload.to_value().unwrap(), value);
    }

    #[test]
    fn test_base64_wrapping() {
        let payload = Payload::from_value(&Value::None).unwrap();
        let text = payload.to_base64();
        assert_eq!(Payload::from_base64(&text).unwrap(), payload);
        assert!(Payload::from_base64("***").is_err());
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let payload = Payload::from_bytes(vec![0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            payload.to_value(),
            Err(KernelError::Serialization { .. })
        ));
    }

    fn nested_lists(depth: usize) -> Value {
        (0..depth).fold(Value::None, |inner, _| Value::List(vec![inner]))
    }

    fn encode_nodes(nodes: &[WireNode]) -> Payload {
        Payload::from_bytes(wire_options().serialize(nodes).unwrap())
    }

    #[test]
    fn test_nesting_up_to_the_limit_decodes() {
        let value = nested_lists(KernelConfig::MAX_PARSE_DEPTH);
        let payload = Payload::from_value(&value).unwrap();
        assert_eq!(payload.to_value().unwrap(), value);
    }

    #[test]
    fn test_nesting_past_the_limit_is_rejected() {
        let payload = Payload::from_value(&nested_lists(KernelConfig::MAX_PARSE_DEPTH + 1)).unwrap();
        assert!(matches!(
            payload.to_value(),
            Err(KernelError::Serialization { .. })
        ));
    }

    #[test]
    fn test_hostile_nesting_fails_without_recursing() {
        let mut nodes: Vec<WireNode> = (0..150_000).map(|_| WireNode::List(1)).collect();
        nodes.push(WireNode::None);
        let err = encode_nodes(&nodes).to_value().unwrap_err();
        assert!(err.to_string().contains("nested deeper"));
    }

    #[test]
    fn test_empty_containers_and_dicts_round_trip() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("a".to_string(), Value::tuple([]));
        map.insert("b".to_string(), Value::List(vec![Value::Set(vec![]), Value::Int(2)]));
        let value = Value::tuple([Value::Dict(map), Value::List(vec![]), Value::str("z")]);

        let payload = Payload::from_value(&value).unwrap();
        assert_eq!(payload.to_value().unwrap(), value);
    }

    #[test]
    fn test_truncated_and_trailing_nodes_are_rejected() {
        let truncated = encode_nodes(&[WireNode::Tuple(2), WireNode::Int(1)]);
        assert!(truncated.to_value().is_err());

        let trailing = encode_nodes(&[WireNode::Int(1), WireNode::Int(2)]);
        assert!(trailing.to_value().is_err());

        let absurd_length = encode_nodes(&[WireNode::List(u64::MAX), WireNode::None]);
        assert!(absurd_length.to_value().is_err());
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let mut bytes = wire_options()
            .serialize(&vec![WireNode::Str(String::new())])
            .unwrap();
        // The trailing eight bytes are the string length; claim far more than
        // the size limit allows.
        let len_offset = bytes.len() - 8;
        bytes[len_offset..].copy_from_slice(&(KernelConfig::MAX_PAYLOAD_BYTES * 4).to_le_bytes());
        assert!(Payload::from_bytes(bytes).to_value().is_err());
    }
}
