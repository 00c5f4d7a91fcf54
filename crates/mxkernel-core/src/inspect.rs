//! Soft type inspection for values owned by optional libraries.
//!
//! Classification only looks at the metadata a [`ForeignValue`] carries
//! (module path and class name), so none of the libraries named here has to
//! be present. New foreign types are one-line additions to the tables below.

use crate::value::{ForeignValue, Scalar, Value};

/// A foreign type identified by library root and class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeSignature {
    pub library: &'static str,
    pub class: &'static str,
}

impl TypeSignature {
    pub const fn new(library: &'static str, class: &'static str) -> Self {
        Self { library, class }
    }

    pub fn matches(&self, value: &Value) -> bool {
        is_instance_of(value, self.class, self.library)
    }
}

/// Heavy tabular containers whose content is never serialized for display.
pub const FRAME_TYPES: &[TypeSignature] = &[
    TypeSignature::new("pandas", "DataFrame"),
    TypeSignature::new("pandas", "Index"),
    TypeSignature::new("pandas", "Series"),
];

/// Array containers whose content is never serialized for display.
pub const ARRAY_TYPES: &[TypeSignature] = &[
    TypeSignature::new("numpy", "ndarray"),
    TypeSignature::new("numpy", "MaskedArray"),
];

/// Converts a boxed foreign scalar to the equivalent native value.
pub type ScalarConverter = fn(&Scalar) -> Value;

const NUMERIC_LIBRARY: &str = "numpy";

/// Numeric scalar type names and their native conversion.
pub const NUMPY_SCALAR_TYPES: &[(&str, ScalarConverter)] = &[
    ("int8", to_native_int),
    ("int16", to_native_int),
    ("int32", to_native_int),
    ("int64", to_native_int),
    ("intc", to_native_int),
    ("intp", to_native_int),
    ("longlong", to_native_int),
    ("uint8", to_native_int),
    ("uint16", to_native_int),
    ("uint32", to_native_int),
    ("uint64", to_native_int),
    ("ulonglong", to_native_int),
    ("float16", to_native_float),
    ("float32", to_native_float),
    ("float64", to_native_float),
    ("longdouble", to_native_float),
];

/// True if `value` is a foreign value of class `type_name` from `library`.
///
/// The library is matched against the root of the value's module path, so
/// `numpy.ma.core.MaskedArray` is an instance of `MaskedArray` from `numpy`.
pub fn is_instance_of(value: &Value, type_name: &str, library: &str) -> bool {
    match value {
        Value::Foreign(foreign) => foreign.class == type_name && foreign.library() == library,
        _ => false,
    }
}

/// True if any of `signatures` matches `value`.
pub fn matches_any(value: &Value, signatures: &[TypeSignature]) -> bool {
    signatures.iter().any(|sig| sig.matches(value))
}

/// True if `value` is a boxed numeric scalar that can be unboxed.
pub fn is_numpy_number(value: &Value) -> bool {
    match value {
        Value::Foreign(foreign) => numpy_scalar(foreign).is_some(),
        _ => false,
    }
}

/// Conversion for the numeric scalar type called `class`, if known.
pub fn numpy_to_py(class: &str) -> Option<ScalarConverter> {
    NUMPY_SCALAR_TYPES
        .iter()
        .find(|(name, _)| *name == class)
        .map(|(_, convert)| *convert)
}

/// Native value of a boxed numeric scalar, `None` for anything else.
pub fn unbox_number(value: &Value) -> Option<Value> {
    match value {
        Value::Foreign(foreign) => {
            let scalar = numpy_scalar(foreign)?;
            let convert = numpy_to_py(&foreign.class)?;
            Some(convert(scalar))
        }
        _ => None,
    }
}

fn numpy_scalar(foreign: &ForeignValue) -> Option<&Scalar> {
    if foreign.library() != NUMERIC_LIBRARY || numpy_to_py(&foreign.class).is_none() {
        return None;
    }
    foreign.scalar.as_ref()
}

fn to_native_int(scalar: &Scalar) -> Value {
    match *scalar {
        Scalar::Int(i) => Value::Int(i),
        Scalar::UInt(u) => Value::Int(i64::try_from(u).unwrap_or(i64::MAX)),
        Scalar::Float(f) => Value::Int(f as i64),
        Scalar::Bool(b) => Value::Int(i64::from(b)),
    }
}

fn to_native_float(scalar: &Scalar) -> Value {
    match *scalar {
        Scalar::Int(i) => Value::Float(i as f64),
        Scalar::UInt(u) => Value::Float(u as f64),
        Scalar::Float(f) => Value::Float(f),
        Scalar::Bool(b) => Value::Float(if b { 1.0 } else { 0.0 }),
    }
}
