//! Model-engine operations, split by domain.

mod models;
mod nodes;
mod objects;
mod queries;

use super::CapabilitySet;
use crate::engine::parse_literal;
use crate::error::{KernelError, Result};
use crate::value::Value;

pub const CAPABILITIES: CapabilitySet = &[
    // Models
    ("mx_new_model", models::new_model),
    ("mx_read_model", models::read_model),
    ("mx_write_model", models::write_model),
    ("mx_del_model", models::del_model),
    ("mx_get_modellist", models::get_modellist),
    ("mx_get_value_info", models::get_value_info),
    // Objects
    ("mx_new_space", objects::new_space),
    ("mx_new_cells", objects::new_cells),
    ("mx_del_object", objects::del_object),
    ("mx_set_formula", objects::set_formula),
    ("mx_import_names", objects::import_names),
    // Queries
    ("mx_get_attrdict", queries::get_attrdict),
    ("mx_get_codelist", queries::get_codelist),
    ("mx_get_value", queries::get_value),
    // Nodes
    ("mx_get_node", nodes::get_node),
    ("mx_get_adjacent", nodes::get_adjacent),
    ("mx_eval_node", nodes::eval_node),
    ("mx_get_evalresult", nodes::get_evalresult),
];

/// Call arguments from a decoded tuple or list.
fn args_from_sequence(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Tuple(items) | Value::List(items) => Ok(items),
        other => Err(KernelError::InvalidParams {
            message: format!("arguments must be a tuple, got {}", other.type_name()),
        }),
    }
}

/// Call arguments from console literal text; a lone value is one argument.
fn args_from_literal(argstr: &str) -> Result<Vec<Value>> {
    if argstr.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(match parse_literal(argstr)? {
        Value::Tuple(items) => items,
        single => vec![single],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_from_literal() {
        assert_eq!(args_from_literal("()").unwrap(), Vec::<Value>::new());
        assert_eq!(args_from_literal("").unwrap(), Vec::<Value>::new());
        assert_eq!(args_from_literal("(3)").unwrap(), vec![Value::Int(3)]);
        assert_eq!(
            args_from_literal("(1, 'x')").unwrap(),
            vec![Value::Int(1), Value::str("x")]
        );
        assert!(matches!(args_from_literal("(x,)"), Err(KernelError::Parse { .. })));
    }

    #[test]
    fn test_args_from_sequence() {
        assert_eq!(
            args_from_sequence(Value::tuple([Value::Int(1)])).unwrap(),
            vec![Value::Int(1)]
        );
        assert!(args_from_sequence(Value::Int(1)).is_err());
    }

    #[test]
    fn test_every_operation_registered_once() {
        let mut names: Vec<&str> = CAPABILITIES.iter().map(|(name, _)| *name).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(total, 18);
    }
}
