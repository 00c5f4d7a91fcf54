//! Node inspection: single nodes and their dependency neighbours.

use super::{args_from_literal, args_from_sequence};
use crate::codec::tuple_json;
use crate::display::display_value_entry;
use crate::engine::{Adjacency, Engine, NodeRef};
use crate::error::{KernelError, Result};
use crate::session::{CallArgs, Reply, Session};
use crate::value::{ObjectKind, ObjectRef, Value};

const NODE_EXTATTRS: &[&str] = &["formula"];

fn display_snapshot(engine: &dyn Engine, node: &NodeRef) -> Result<Value> {
    let mut data = engine.node_snapshot(node, NODE_EXTATTRS)?;
    display_value_entry(&mut data);
    Ok(data)
}

/// Evaluate a node and return its display-safe snapshot.
///
/// `args` is a payload holding the argument tuple.
pub(super) fn get_node(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let fullname = args.require_str(0, "fullname")?;
    let call_args = args_from_sequence(args.require_payload(1, "args")?.to_value()?)?;

    let engine = session.engine_mut();
    let cells = engine.resolve(fullname)?;
    let node = NodeRef::new(cells, call_args);
    engine.evaluate(&node)?;

    Reply::payload(&display_snapshot(engine, &node)?)
}

/// Snapshots of the predecessors or successors of a node.
///
/// `jsonargs` is the argument tuple in tuple-preserving JSON.
pub(super) fn get_adjacent(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let obj = args.require_str(0, "obj")?;
    let jsonargs = args.require_str(1, "jsonargs")?;
    let adjacency = Adjacency::parse(args.require_str(2, "adjacency")?)?;

    let call_args = args_from_sequence(tuple_json::decode(jsonargs)?)?;
    let engine = session.engine();
    let cells = engine.resolve(obj)?;

    let nodes = engine
        .adjacent(&NodeRef::new(cells, call_args), adjacency)?
        .iter()
        .map(|node| display_snapshot(engine, node))
        .collect::<Result<Vec<_>>>()?;

    Reply::payload(&Value::List(nodes))
}

/// Snapshot of a node named by a session-variable expression such as
/// `space.foo`, without evaluating it.
pub(super) fn eval_node(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let expr = args.require_str(0, "expr")?;
    let argstr = args.get_str(1, "argstr")?.unwrap_or_default();

    let call_args = args_from_literal(argstr)?;
    let cells = resolve_expr(session, expr)?;
    let node = NodeRef::new(cells, call_args);

    Reply::payload(&display_snapshot(session.engine(), &node)?)
}

/// Push an evaluation result to the front end as a kernel message.
pub(super) fn get_evalresult(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let msgtype = args.require_str(0, "msgtype")?;
    let data = match args.get(1, "data") {
        Some(_) => args.require_payload(1, "data")?.to_value()?,
        None => Value::None,
    };

    session.publish_eval_result(msgtype, data);
    Ok(Reply::Unit)
}

/// Resolve `var.child.child` where `var` is a session variable bound to an
/// engine object.
fn resolve_expr(session: &Session, expr: &str) -> Result<ObjectRef> {
    let mut segments = expr.split('.').map(str::trim);
    let head = segments.next().unwrap_or_default();

    let mut obj = match session.var(head) {
        Some(Value::Object(obj)) => obj.clone(),
        Some(other) => {
            return Err(KernelError::InvalidParams {
                message: format!("{} is a {}, not an engine object", head, other.type_name()),
            })
        }
        None => return Err(KernelError::not_found(head)),
    };

    for segment in segments {
        obj = session.engine().resolve_in(&obj, segment)?;
    }

    if obj.kind != ObjectKind::Cells {
        return Err(KernelError::InvalidParams {
            message: format!("{} does not name cells", expr),
        });
    }
    Ok(obj)
}
