//! Variable-namespace operations shared by every session.

use super::{CallArgs, CapabilitySet, Reply, Session};
use crate::display::to_display_value;
use crate::error::{KernelError, Result};
use serde_json::Value as JsonValue;

pub const CAPABILITIES: CapabilitySet = &[
    ("is_defined", is_defined),
    ("get_var_names", get_var_names),
    ("get_var_display", get_var_display),
    ("remove_var", remove_var),
];

fn is_defined(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let name = args.require_str(0, "name")?;
    Ok(Reply::Json(JsonValue::Bool(session.var(name).is_some())))
}

fn get_var_names(session: &mut Session, _args: &CallArgs) -> Result<Reply> {
    Ok(Reply::Json(JsonValue::from(session.var_names())))
}

fn get_var_display(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let name = args.require_str(0, "name")?;
    let value = session.var(name).ok_or_else(|| KernelError::not_found(name))?;
    Reply::payload(&to_display_value(value))
}

fn remove_var(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let name = args.require_str(0, "name")?;
    session
        .remove_var(name)
        .map(|_| Reply::Unit)
        .ok_or_else(|| KernelError::not_found(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;
    use crate::notify::BroadcastPublisher;
    use crate::value::Value;
    use serde_json::json;
    use std::sync::Arc;

    fn session() -> Session {
        Session::new(
            Box::new(InMemoryEngine::new()),
            Arc::new(BroadcastPublisher::new(4)),
        )
    }

    #[test]
    fn test_variable_lifecycle() {
        let mut session = session();
        session.define_var("b", Value::Int(1), true);
        session.define_var("a", Value::List(vec![]), true);

        let names = session.dispatch("get_var_names", &CallArgs::new()).unwrap();
        assert_eq!(names, Reply::Json(json!(["a", "b"])));

        let defined = session
            .dispatch("is_defined", &CallArgs::positional([json!("a")]))
            .unwrap();
        assert_eq!(defined, Reply::Json(json!(true)));

        let display = session
            .dispatch("get_var_display", &CallArgs::new().with("name", "a"))
            .unwrap();
        assert_eq!(
            display.to_value().unwrap().unwrap(),
            Value::str("Type: list")
        );

        session
            .dispatch("remove_var", &CallArgs::new().with("name", "a"))
            .unwrap();
        assert!(session.var("a").is_none());
    }

    #[test]
    fn test_missing_variable() {
        let mut session = session();
        let args = CallArgs::new().with("name", "ghost");
        assert!(matches!(
            session.dispatch("get_var_display", &args),
            Err(KernelError::Resolution { .. })
        ));
        assert!(matches!(
            session.dispatch("remove_var", &args),
            Err(KernelError::Resolution { .. })
        ));
        assert_eq!(
            session.dispatch("is_defined", &args).unwrap(),
            Reply::Json(json!(false))
        );
    }
}
