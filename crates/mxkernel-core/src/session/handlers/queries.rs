//! Attribute and value queries.

use super::args_from_literal;
use crate::engine::{Lookup, NodeRef};
use crate::error::{KernelError, Result};
use crate::session::{CallArgs, Reply, Session};
use crate::value::Value;

/// Snapshot of `fullname`, or of the current model when no name is given.
///
/// An unresolvable name yields a `None` payload rather than an error.
pub(super) fn get_attrdict(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let fullname = args.get_str(0, "fullname")?;
    let attrs = args.get_str_list(1, "attrs")?;
    let recursive = args.get_bool(2, "recursive")?;

    let engine = session.engine();
    let target = match fullname {
        None => engine.current_model(),
        Some(name) => match engine.resolve(name) {
            Ok(obj) => Some(obj),
            Err(KernelError::Resolution { .. }) => None,
            Err(e) => return Err(e),
        },
    };

    let data = match target {
        Some(obj) => engine.snapshot(&obj, attrs.as_deref(), recursive)?,
        None => Value::None,
    };
    Reply::payload(&data)
}

/// Formula snapshot of `fullname`; any failure yields a `None` payload.
pub(super) fn get_codelist(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let fullname = args.get_str(0, "fullname")?.unwrap_or_default();
    let engine = session.engine();

    let attrs = ["formula".to_string()];
    let data = engine
        .resolve(fullname)
        .and_then(|obj| engine.snapshot(&obj, Some(&attrs), false))
        .unwrap_or(Value::None);
    Reply::payload(&data)
}

/// `[value, just_computed]` for a reference or a cells node.
pub(super) fn get_value(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let fullname = args.require_str(0, "fullname")?;
    let argstr = args.get_str(1, "argstr")?.unwrap_or_default();
    let calc = args.get_bool(2, "calc")?;

    let call_args = args_from_literal(argstr)?;
    let engine = session.engine_mut();
    let obj = engine.resolve(fullname)?;

    let (value, computed) = match engine.lookup(&obj, &call_args)? {
        Lookup::Found(value) => (value, false),
        Lookup::NeedsComputation if calc => {
            let value = engine.evaluate(&NodeRef::new(obj, call_args))?;
            (value, true)
        }
        Lookup::NeedsComputation => {
            return Err(KernelError::ValueNotReady {
                target: argstr.to_string(),
            })
        }
        Lookup::NotFound => return Err(KernelError::not_found(fullname)),
    };

    Reply::payload(&Value::List(vec![value, Value::Bool(computed)]))
}
