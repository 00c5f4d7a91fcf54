//! Model lifecycle and model-wide queries.

use crate::display::to_display_value;
use crate::error::Result;
use crate::session::{CallArgs, Reply, Session};
use crate::value::Value;
use std::collections::BTreeMap;
use std::path::Path;

pub(super) fn new_model(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let name = args.get_nonblank(0, "name")?;
    let define_var = args.get_bool(1, "define_var")?;
    let varname = args.get_str(2, "varname")?;

    let model = session.engine_mut().new_model(name)?;
    if define_var {
        session.define_object_var(&model, varname, true);
    }
    Ok(Reply::Unit)
}

pub(super) fn read_model(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let path = args.require_str(0, "modelpath")?;
    let name = args.get_nonblank(1, "name")?;
    let define_var = args.get_bool(2, "define_var")?;
    let varname = args.get_str(3, "varname")?;

    let model = session.engine_mut().read_model(Path::new(path), name)?;
    if define_var {
        session.define_object_var(&model, varname, true);
    }
    Ok(Reply::Unit)
}

pub(super) fn write_model(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let model = args.require_str(0, "model")?;
    let path = args.require_str(1, "modelpath")?;
    let backup = args.get_bool(2, "backup")?;
    let zipmodel = args.get_bool(3, "zipmodel")?;

    session
        .engine()
        .write_model(model, Path::new(path), backup, zipmodel)?;
    Ok(Reply::Unit)
}

pub(super) fn del_model(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let name = args.require_str(0, "name")?;
    session.engine_mut().close_model(name)?;
    Ok(Reply::Unit)
}

/// Snapshots of every model, led by the current model's snapshot (or None).
pub(super) fn get_modellist(session: &mut Session, _args: &CallArgs) -> Result<Reply> {
    let engine = session.engine();

    let mut data = Vec::new();
    for name in engine.model_names() {
        let model = engine.get_model(&name)?;
        data.push(engine.snapshot(&model, None, false)?);
    }

    let current = match engine.current_model() {
        Some(model) => engine.snapshot(&model, None, false)?,
        None => Value::None,
    };
    data.insert(0, current);

    Reply::payload(&Value::List(data))
}

pub(super) fn get_value_info(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let model = args.require_str(0, "model")?;
    let engine = session.engine();

    let mut records = Vec::new();
    for assoc in engine.assoc_values(model)? {
        let value = to_display_value(&assoc.value);

        let spec = match assoc.spec {
            Some(mut spec) => {
                if let Some(entry) = spec.as_dict_mut().and_then(|map| map.get_mut("value")) {
                    *entry = value.clone();
                }
                spec
            }
            None => Value::None,
        };

        let refs = assoc
            .refs
            .iter()
            .map(|reference| engine.snapshot(reference, None, false))
            .collect::<Result<Vec<_>>>()?;

        let mut record = BTreeMap::new();
        record.insert("value".to_string(), value);
        record.insert("spec".to_string(), spec);
        record.insert("refs".to_string(), Value::List(refs));
        records.push(Value::Dict(record));
    }

    Reply::payload(&Value::List(records))
}
