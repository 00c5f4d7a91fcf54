//! Values handed out by the engine.
//!
//! [`Value`] covers everything a handler may need to serialize: plain
//! scalars and containers, handles to engine objects, and values owned by
//! optional external libraries ([`ForeignValue`]) that the kernel only knows
//! by their type metadata.
//!
//! Values travel inside bincode payloads, so no field here may use
//! `skip_serializing_if`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of an engine object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Model,
    Space,
    Cells,
    Reference,
}

impl ObjectKind {
    /// Class name reported in snapshots and reprs.
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectKind::Model => "Model",
            ObjectKind::Space => "UserSpace",
            ObjectKind::Cells => "Cells",
            ObjectKind::Reference => "Reference",
        }
    }
}

/// Handle to an engine object, addressed by its dotted full name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub fullname: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, fullname: impl Into<String>) -> Self {
        Self {
            kind,
            fullname: fullname.into(),
        }
    }

    /// Last segment of the full name.
    pub fn name(&self) -> &str {
        self.fullname
            .rsplit_once('.')
            .map(|(_, name)| name)
            .unwrap_or(&self.fullname)
    }

    /// Full name of the owning object, `None` for models.
    pub fn parent_name(&self) -> Option<&str> {
        self.fullname.rsplit_once('.').map(|(parent, _)| parent)
    }

    /// Name of the model this object lives in.
    pub fn model_name(&self) -> &str {
        self.fullname
            .split_once('.')
            .map(|(model, _)| model)
            .unwrap_or(&self.fullname)
    }

    /// Full name of a child of this object.
    pub fn child_name(&self, name: &str) -> String {
        format!("{}.{}", self.fullname, name)
    }

    pub fn repr(&self) -> String {
        format!("<{} {}>", self.kind.type_name(), self.fullname)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

/// Scalar payload boxed inside a foreign numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

/// A value owned by an optional external library.
///
/// Only the type metadata and the textual representation are known; boxed
/// numeric scalars additionally carry their payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignValue {
    /// Module path of the value's type, e.g. `pandas.core.frame`.
    pub module: String,
    /// Class name of the value's type, e.g. `DataFrame`.
    pub class: String,
    pub repr: String,
    pub scalar: Option<Scalar>,
}

impl ForeignValue {
    pub fn new(
        module: impl Into<String>,
        class: impl Into<String>,
        repr: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            class: class.into(),
            repr: repr.into(),
            scalar: None,
        }
    }

    pub fn with_scalar(mut self, scalar: Scalar) -> Self {
        self.scalar = Some(scalar);
        self
    }

    /// Root package of the type's module path.
    pub fn library(&self) -> &str {
        self.module.split('.').next().unwrap_or(&self.module)
    }
}

/// Any value the engine can produce or receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    /// Handle to a model, space, cells or reference.
    Object(ObjectRef),
    /// An imported module, by name.
    Module(String),
    /// An I/O resource descriptor, by its repr.
    Resource(String),
    Foreign(ForeignValue),
}

impl Value {
    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(items.into_iter().collect())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Items of a list or tuple.
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Truth value following the console language's rules.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => !items.is_empty(),
            Value::Dict(map) => !map.is_empty(),
            _ => true,
        }
    }

    /// Concrete class name of the value.
    pub fn type_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Object(obj) => obj.kind.type_name(),
            Value::Module(_) => "module",
            Value::Resource(_) => "IOSpec",
            Value::Foreign(f) => &f.class,
        }
    }

    /// Console-style textual representation.
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => float_repr(*f),
            Value::Str(s) => str_repr(s),
            Value::List(items) => format!("[{}]", join_reprs(items)),
            Value::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Value::Tuple(items) => format!("({})", join_reprs(items)),
            Value::Set(items) if items.is_empty() => "set()".to_string(),
            Value::Set(items) => format!("{{{}}}", join_reprs(items)),
            Value::Dict(map) => {
                let entries: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{}: {}", str_repr(k), v.repr()))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Value::Object(obj) => obj.repr(),
            Value::Module(name) => format!("<module '{}'>", name),
            Value::Resource(repr) => repr.clone(),
            Value::Foreign(f) => f.repr.clone(),
        }
    }
}

fn join_reprs(items: &[Value]) -> String {
    items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
}

fn float_repr(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

fn str_repr(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Object(obj)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Dict(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_names() {
        let obj = ObjectRef::new(ObjectKind::Cells, "Model1.Space1.foo");
        assert_eq!(obj.name(), "foo");
        assert_eq!(obj.parent_name(), Some("Model1.Space1"));
        assert_eq!(obj.model_name(), "Model1");
        assert_eq!(obj.repr(), "<Cells Model1.Space1.foo>");

        let model = ObjectRef::new(ObjectKind::Model, "Model1");
        assert_eq!(model.parent_name(), None);
        assert_eq!(model.model_name(), "Model1");
    }

    #[test]
    fn test_repr_matches_console_style() {
        assert_eq!(Value::None.repr(), "None");
        assert_eq!(Value::Bool(true).repr(), "True");
        assert_eq!(Value::Float(2.0).repr(), "2.0");
        assert_eq!(Value::Float(0.5).repr(), "0.5");
        assert_eq!(Value::str("it's").repr(), "'it\\'s'");
        assert_eq!(Value::tuple([Value::Int(1)]).repr(), "(1,)");
        assert_eq!(Value::tuple([]).repr(), "()");
        assert_eq!(Value::Set(vec![]).repr(), "set()");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::str("a")]).repr(),
            "[1, 'a']"
        );
        assert_eq!(Value::Module("math".into()).repr(), "<module 'math'>");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::str("x").is_truthy());
        assert!(!Value::Tuple(vec![]).is_truthy());
        assert!(Value::Object(ObjectRef::new(ObjectKind::Model, "M")).is_truthy());
    }

    #[test]
    fn test_foreign_library_root() {
        let frame = ForeignValue::new("pandas.core.frame", "DataFrame", "<frame>");
        assert_eq!(frame.library(), "pandas");
        assert_eq!(Value::Foreign(frame).type_name(), "DataFrame");
    }
}
