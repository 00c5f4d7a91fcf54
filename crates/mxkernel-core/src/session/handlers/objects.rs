//! Creating, deleting and importing engine objects.

use crate::engine::Lookup;
use crate::error::Result;
use crate::session::{CallArgs, Reply, Session};
use crate::value::{ObjectKind, ObjectRef, Value};

pub(super) fn new_space(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let model = args.get_nonblank(0, "model")?;
    let parent = args.get_nonblank(1, "parent")?;
    let name = args.get_nonblank(2, "name")?;
    let bases = args.get_nonblank(3, "bases")?;
    let define_var = args.get_bool(4, "define_var")?;
    let varname = args.get_str(5, "varname")?;

    let model = session.get_or_create_model(model)?;
    let engine = session.engine_mut();

    let parent = match parent {
        Some(parent) => engine.resolve(parent)?,
        None => model.clone(),
    };

    let bases = match bases {
        Some(bases) => bases
            .split(',')
            .map(|base| engine.resolve_in(&model, base.trim()))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    let space = engine.new_space(&parent, name, &bases)?;
    if define_var {
        session.define_object_var(&space, varname, true);
    }
    Ok(Reply::Unit)
}

/// Create cells under `parent`, the current space, or a new space.
pub(super) fn new_cells(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let model = args.get_nonblank(0, "model")?;
    let parent = args.get_nonblank(1, "parent")?;
    let name = args.get_nonblank(2, "name")?;
    let define_var = args.get_bool(3, "define_var")?;
    let varname = args.get_str(4, "varname")?;
    let formula = args.get_nonblank(5, "formula")?;

    let model = session.get_or_create_model(model)?;
    let engine = session.engine_mut();

    let parent = match parent {
        Some(parent) => engine.resolve_in(&model, parent)?,
        None => match engine.current_space(&model) {
            Some(space) => space,
            None => engine.new_space(&model, None, &[])?,
        },
    };

    let cells = engine.new_cells(&parent, name, formula)?;
    if define_var {
        session.define_object_var(&cells, varname, true);
    }
    Ok(Reply::Unit)
}

pub(super) fn del_object(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let parent = args.require_str(0, "parent")?;
    let name = args.require_str(1, "name")?;

    let engine = session.engine_mut();
    let parent = engine.resolve(parent)?;
    engine.delete_child(&parent, name)?;
    Ok(Reply::Unit)
}

pub(super) fn set_formula(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let fullname = args.require_str(0, "fullname")?;
    let formula = args.require_str(1, "formula")?;

    let engine = session.engine_mut();
    let cells = engine.resolve(fullname)?;
    engine.set_formula(&cells, formula)?;
    Ok(Reply::Unit)
}

/// Bind an object and/or its children into the session variables.
///
/// References are bound to their values under their own names.
pub(super) fn import_names(session: &mut Session, args: &CallArgs) -> Result<Reply> {
    let fullname = args.require_str(0, "fullname")?;
    let import_selected = args.get_bool(1, "import_selected")?;
    let import_children = args.get_bool(2, "import_children")?;
    let replace_existing = args.get_bool(3, "replace_existing")?;

    let obj = session.engine().resolve(fullname)?;

    if import_selected {
        if obj.kind == ObjectKind::Reference {
            let value = reference_value(session, &obj)?;
            session.define_var(obj.name(), value, replace_existing);
        } else {
            session.define_object_var(&obj, None, replace_existing);
        }
    }

    if import_children && matches!(obj.kind, ObjectKind::Model | ObjectKind::Space) {
        let children = session.engine().children(&obj)?;
        for child in children.spaces.iter().chain(&children.cells) {
            session.define_object_var(child, None, replace_existing);
        }
        for reference in &children.refs {
            let value = reference_value(session, reference)?;
            session.define_var(reference.name(), value, replace_existing);
        }
    }

    Ok(Reply::Unit)
}

fn reference_value(session: &Session, reference: &ObjectRef) -> Result<Value> {
    Ok(match session.engine().lookup(reference, &[])? {
        Lookup::Found(value) => value,
        Lookup::NeedsComputation | Lookup::NotFound => Value::None,
    })
}
