//! Display-safe rendering of engine values.
//!
//! [`to_display_value`] turns any value into something the front end can show
//! without materializing large payloads. Rules are applied in order; the
//! order matters because frames and boxed scalars are also foreign values.

use crate::config::DisplayConfig;
use crate::inspect::{matches_any, unbox_number, ARRAY_TYPES, FRAME_TYPES};
use crate::value::Value;

/// Render `value` for display. Never fails, never recurses into containers.
pub fn to_display_value(value: &Value) -> Value {
    match value {
        Value::Object(_) | Value::Str(_) | Value::Resource(_) | Value::Module(_) => {
            Value::Str(value.repr())
        }
        Value::Foreign(_) if matches_any(value, FRAME_TYPES) => type_summary(value),
        Value::Foreign(_) if matches_any(value, ARRAY_TYPES) => type_summary(value),
        Value::List(_) | Value::Set(_) | Value::Tuple(_) | Value::Dict(_) => type_summary(value),
        Value::Foreign(_) => unbox_number(value).unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

/// `"Type: <ClassName>"` summary for values whose content is not shown.
pub fn type_summary(value: &Value) -> Value {
    Value::Str(format!("{}{}", DisplayConfig::TYPE_PREFIX, value.type_name()))
}

/// Replace the `value` entry of a snapshot with its display form, if present.
pub fn display_value_entry(snapshot: &mut Value) {
    if let Some(entry) = snapshot.as_dict_mut().and_then(|map| map.get_mut("value")) {
        *entry = to_display_value(entry);
    }
}
