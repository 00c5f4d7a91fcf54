//! Engine capability surface.
//!
//! Handlers only talk to the object graph through [`Engine`]. The crate ships
//! [`InMemoryEngine`], a small reference implementation with its own formula
//! language and on-disk model format.

pub mod formula;
pub mod memory;
pub mod persist;

pub use formula::{parse_literal, Formula};
pub use memory::InMemoryEngine;

use crate::error::{KernelError, Result};
use crate::value::{ObjectRef, Value};
use std::path::Path;

/// A cells object paired with call arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRef {
    pub cells: ObjectRef,
    pub args: Vec<Value>,
}

impl NodeRef {
    pub fn new(cells: ObjectRef, args: Vec<Value>) -> Self {
        Self { cells, args }
    }

    /// Args rendered as a tuple, e.g. `(1, 'a')`.
    pub fn args_repr(&self) -> String {
        Value::Tuple(self.args.clone()).repr()
    }
}

/// Outcome of looking up a stored value without computing it.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// A value is stored for the target.
    Found(Value),
    /// The target is a cells node whose value has not been computed.
    NeedsComputation,
    /// The target cannot hold a value.
    NotFound,
}

/// Direction of a dependency query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjacency {
    /// Nodes the queried node calls.
    Predecessors,
    /// Nodes that call the queried node.
    Successors,
}

impl Adjacency {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "preds" => Ok(Adjacency::Predecessors),
            "succs" => Ok(Adjacency::Successors),
            other => Err(KernelError::InvalidParams {
                message: format!("adjacency must be 'preds' or 'succs', got '{}'", other),
            }),
        }
    }
}

/// Named children of a model or space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Children {
    pub spaces: Vec<ObjectRef>,
    pub cells: Vec<ObjectRef>,
    /// References by name.
    pub refs: Vec<ObjectRef>,
}

/// A value referenced from a model, with everything pointing at it.
#[derive(Debug, Clone, PartialEq)]
pub struct AssocValue {
    pub value: Value,
    /// Snapshot of the resource spec behind the value, if any.
    pub spec: Option<Value>,
    pub refs: Vec<ObjectRef>,
}

/// Object-graph operations used by the handler set.
///
/// Every object is addressed by [`ObjectRef`]; implementations resolve it
/// freshly on each call and must fail with [`KernelError::Resolution`] when it
/// no longer exists.
pub trait Engine: Send {
    /// Names of open models in creation order.
    fn model_names(&self) -> Vec<String>;

    fn current_model(&self) -> Option<ObjectRef>;

    /// Create a model and make it current. `None` picks a fresh name.
    fn new_model(&mut self, name: Option<&str>) -> Result<ObjectRef>;

    /// Load a model written by [`Engine::write_model`], optionally renamed.
    fn read_model(&mut self, path: &Path, name: Option<&str>) -> Result<ObjectRef>;

    /// Persist a model to a directory, or to a zip archive when `archive`.
    ///
    /// With `backup`, an existing target is renamed out of the way instead
    /// of being replaced.
    fn write_model(&self, model: &str, path: &Path, backup: bool, archive: bool) -> Result<()>;

    fn close_model(&mut self, name: &str) -> Result<()>;

    fn get_model(&self, name: &str) -> Result<ObjectRef>;

    /// Resolve a dotted full name.
    fn resolve(&self, fullname: &str) -> Result<ObjectRef>;

    /// Resolve a dotted name relative to `scope`.
    fn resolve_in(&self, scope: &ObjectRef, name: &str) -> Result<ObjectRef>;

    /// Current space of a model, if one is set.
    fn current_space(&self, model: &ObjectRef) -> Option<ObjectRef>;

    fn new_space(
        &mut self,
        parent: &ObjectRef,
        name: Option<&str>,
        bases: &[ObjectRef],
    ) -> Result<ObjectRef>;

    /// Create cells. Naming follows the formula when `name` is `None`.
    fn new_cells(
        &mut self,
        parent: &ObjectRef,
        name: Option<&str>,
        formula: Option<&str>,
    ) -> Result<ObjectRef>;

    /// Bind a reference, replacing any existing one of the same name.
    fn set_ref(&mut self, parent: &ObjectRef, name: &str, value: Value) -> Result<ObjectRef>;

    fn delete_child(&mut self, parent: &ObjectRef, name: &str) -> Result<()>;

    /// Replace a cells formula and drop every value depending on it.
    fn set_formula(&mut self, cells: &ObjectRef, formula: &str) -> Result<()>;

    fn children(&self, obj: &ObjectRef) -> Result<Children>;

    /// Attribute dictionary of an object, optionally restricted to `attrs`.
    fn snapshot(&self, obj: &ObjectRef, attrs: Option<&[String]>, recursive: bool)
        -> Result<Value>;

    /// Stored value of a reference or a cells node.
    fn lookup(&self, obj: &ObjectRef, args: &[Value]) -> Result<Lookup>;

    /// Value of a node, computing it if needed.
    fn evaluate(&mut self, node: &NodeRef) -> Result<Value>;

    /// Attribute dictionary of a node. `extattrs` adds cells attributes
    /// such as `formula`.
    fn node_snapshot(&self, node: &NodeRef, extattrs: &[&str]) -> Result<Value>;

    fn adjacent(&self, node: &NodeRef, adjacency: Adjacency) -> Result<Vec<NodeRef>>;

    fn assoc_values(&self, model: &str) -> Result<Vec<AssocValue>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObjectKind;

    #[test]
    fn test_adjacency_names() {
        assert_eq!(Adjacency::parse("preds").unwrap(), Adjacency::Predecessors);
        assert_eq!(Adjacency::parse("succs").unwrap(), Adjacency::Successors);
        assert!(matches!(
            Adjacency::parse("parents"),
            Err(KernelError::InvalidParams { .. })
        ));
    }

    #[test]
    fn test_node_args_repr() {
        let node = NodeRef::new(
            ObjectRef::new(ObjectKind::Cells, "M.S.foo"),
            vec![Value::Int(1)],
        );
        assert_eq!(node.args_repr(), "(1,)");
    }
}
