//! In-memory reference engine.
//!
//! Models own a tree of spaces; spaces own cells, references and child
//! spaces. Cells cache their values per argument tuple, and every cached
//! node is tracked in a dependency graph so formula edits and deletions
//! drop exactly the values that depended on them.

use super::formula::{BinOp, CmpOp, Expr, Formula};
use super::persist::{self, CellsFile, ModelFile, SpaceFile};
use super::{Adjacency, AssocValue, Children, Engine, Lookup, NodeRef};
use crate::config::{KernelConfig, PersistConfig};
use crate::engine::formula::is_identifier;
use crate::error::{KernelError, Result};
use crate::value::{ObjectKind, ObjectRef, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
struct Namespace {
    spaces: BTreeMap<String, SpaceData>,
    cells: BTreeMap<String, CellsData>,
    refs: BTreeMap<String, Value>,
}

impl Namespace {
    fn contains(&self, name: &str) -> bool {
        self.spaces.contains_key(name)
            || self.cells.contains_key(name)
            || self.refs.contains_key(name)
    }
}

#[derive(Debug, Clone, Default)]
struct SpaceData {
    bases: Vec<String>,
    ns: Namespace,
}

#[derive(Debug, Clone)]
struct CellsData {
    formula: Arc<Formula>,
    cache: BTreeMap<String, CachedValue>,
}

impl CellsData {
    fn new(formula: Formula) -> Self {
        Self {
            formula: Arc::new(formula),
            cache: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedValue {
    args: Vec<Value>,
    value: Value,
}

#[derive(Debug, Clone)]
struct ModelData {
    name: String,
    root: Namespace,
    current_space: Option<String>,
}

/// Cached node identity: cells full name plus the args tuple repr.
///
/// Numerically equal args share a key, so `f(1)`, `f(1.0)` and `f(True)`
/// name the same node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct NodeKey {
    cells: String,
    args: String,
}

impl NodeKey {
    fn new(cells: &str, args: &[Value]) -> Self {
        Self {
            cells: cells.to_string(),
            args: Value::Tuple(args.iter().map(key_form).collect()).repr(),
        }
    }

    fn label(&self) -> String {
        format!("{}{}", self.cells, self.args)
    }

    fn within(&self, prefix: &str) -> bool {
        self.cells == prefix
            || self
                .cells
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

/// Canonical form of an argument for node identity.
fn key_form(value: &Value) -> Value {
    const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;
    match value {
        Value::Bool(b) => Value::Int(i64::from(*b)),
        Value::Float(f) if f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(f) => {
            Value::Int(*f as i64)
        }
        Value::Tuple(items) => Value::Tuple(items.iter().map(key_form).collect()),
        Value::List(items) => Value::List(items.iter().map(key_form).collect()),
        Value::Set(items) => Value::Set(items.iter().map(key_form).collect()),
        Value::Dict(map) => Value::Dict(
            map.iter()
                .map(|(key, item)| (key.clone(), key_form(item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Call edges between cached nodes.
///
/// Every cached node has an entry in both maps, possibly empty.
#[derive(Debug, Default)]
struct DepGraph {
    /// node -> nodes it called
    preds: BTreeMap<NodeKey, BTreeSet<NodeKey>>,
    /// node -> nodes that called it
    succs: BTreeMap<NodeKey, BTreeSet<NodeKey>>,
}

impl DepGraph {
    fn touch(&mut self, key: &NodeKey) {
        self.preds.entry(key.clone()).or_default();
        self.succs.entry(key.clone()).or_default();
    }

    fn add_edge(&mut self, callee: &NodeKey, caller: &NodeKey) {
        self.touch(callee);
        self.touch(caller);
        self.preds.entry(caller.clone()).or_default().insert(callee.clone());
        self.succs.entry(callee.clone()).or_default().insert(caller.clone());
    }

    fn remove(&mut self, key: &NodeKey) {
        for pred in self.preds.remove(key).unwrap_or_default() {
            if let Some(succs) = self.succs.get_mut(&pred) {
                succs.remove(key);
            }
        }
        for succ in self.succs.remove(key).unwrap_or_default() {
            if let Some(preds) = self.preds.get_mut(&succ) {
                preds.remove(key);
            }
        }
    }

    /// Roots plus every node transitively depending on them.
    fn dependents(&self, roots: Vec<NodeKey>) -> BTreeSet<NodeKey> {
        let mut seen = BTreeSet::new();
        let mut stack = roots;
        while let Some(key) = stack.pop() {
            if let Some(succs) = self.succs.get(&key) {
                stack.extend(succs.iter().filter(|s| !seen.contains(*s)).cloned());
            }
            seen.insert(key);
        }
        seen
    }

    fn keys_within(&self, prefix: &str) -> Vec<NodeKey> {
        self.preds.keys().filter(|k| k.within(prefix)).cloned().collect()
    }

    fn neighbors(&self, key: &NodeKey, adjacency: Adjacency) -> Vec<NodeKey> {
        let map = match adjacency {
            Adjacency::Predecessors => &self.preds,
            Adjacency::Successors => &self.succs,
        };
        map.get(key).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }
}

/// Name resolution context for one formula evaluation.
struct Scope<'a> {
    node: &'a str,
    space: &'a str,
    locals: &'a BTreeMap<String, Value>,
}

/// Reference engine holding every model in memory.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    models: Vec<ModelData>,
    current: Option<String>,
    graph: DepGraph,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn model(&self, name: &str) -> Result<&ModelData> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| KernelError::not_found(name))
    }

    fn model_mut(&mut self, name: &str) -> Result<&mut ModelData> {
        self.models
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| KernelError::not_found(name))
    }

    /// Namespace of a model or space by full name.
    fn namespace(&self, fullname: &str) -> Option<&Namespace> {
        let mut segments = fullname.split('.');
        let model = self.models.iter().find(|m| Some(m.name.as_str()) == segments.next())?;
        let mut ns = &model.root;
        for segment in segments {
            ns = &ns.spaces.get(segment)?.ns;
        }
        Some(ns)
    }

    fn namespace_mut(&mut self, fullname: &str) -> Option<&mut Namespace> {
        let mut segments = fullname.split('.');
        let first = segments.next();
        let model = self.models.iter_mut().find(|m| Some(m.name.as_str()) == first)?;
        let mut ns = &mut model.root;
        for segment in segments {
            ns = &mut ns.spaces.get_mut(segment)?.ns;
        }
        Some(ns)
    }

    fn cells_data(&self, fullname: &str) -> Option<&CellsData> {
        let (parent, name) = fullname.rsplit_once('.')?;
        self.namespace(parent)?.cells.get(name)
    }

    fn cells_data_mut(&mut self, fullname: &str) -> Option<&mut CellsData> {
        let (parent, name) = fullname.rsplit_once('.')?;
        self.namespace_mut(parent)?.cells.get_mut(name)
    }

    /// Re-resolve a handle and check it still names an object of `kinds`.
    fn expect_kind(&self, obj: &ObjectRef, kinds: &[ObjectKind]) -> Result<ObjectRef> {
        let current = self.resolve(&obj.fullname)?;
        if kinds.contains(&current.kind) {
            Ok(current)
        } else {
            Err(KernelError::engine(format!(
                "{} is a {}, expected {}",
                current.fullname,
                current.kind.type_name(),
                kinds
                    .iter()
                    .map(ObjectKind::type_name)
                    .collect::<Vec<_>>()
                    .join(" or ")
            )))
        }
    }

    fn parent_namespace_mut(&mut self, parent: &ObjectRef) -> Result<&mut Namespace> {
        self.expect_kind(parent, &[ObjectKind::Model, ObjectKind::Space])?;
        self.namespace_mut(&parent.fullname)
            .ok_or_else(|| KernelError::not_found(&parent.fullname))
    }

    /// Drop cached values of `roots` and everything depending on them.
    fn clear_nodes(&mut self, roots: Vec<NodeKey>) {
        if roots.is_empty() {
            return;
        }
        let cleared = self.graph.dependents(roots);
        for key in &cleared {
            if let Some(cells) = self.cells_data_mut(&key.cells) {
                cells.cache.remove(&key.args);
            }
            self.graph.remove(key);
        }
        debug!("Cleared {} cached node(s)", cleared.len());
    }

    fn clear_within(&mut self, prefix: &str) {
        let roots = self.graph.keys_within(prefix);
        self.clear_nodes(roots);
    }

    fn eval_node(
        &mut self,
        cells: &str,
        args: Vec<Value>,
        stack: &mut Vec<NodeKey>,
    ) -> Result<Value> {
        let key = NodeKey::new(cells, &args);

        let formula = {
            let data = self
                .cells_data(cells)
                .ok_or_else(|| KernelError::not_found(cells))?;
            if let Some(cached) = data.cache.get(&key.args) {
                let value = cached.value.clone();
                if let Some(caller) = stack.last() {
                    self.graph.add_edge(&key, caller);
                }
                return Ok(value);
            }
            Arc::clone(&data.formula)
        };

        if stack.contains(&key) {
            return Err(KernelError::Evaluation {
                node: key.label(),
                message: "cyclic reference".to_string(),
            });
        }
        if stack.len() >= KernelConfig::MAX_EVAL_DEPTH {
            return Err(KernelError::Evaluation {
                node: key.label(),
                message: "maximum evaluation depth exceeded".to_string(),
            });
        }
        if formula.params().len() != args.len() {
            return Err(KernelError::Evaluation {
                node: key.label(),
                message: format!(
                    "expected {} argument(s), got {}",
                    formula.params().len(),
                    args.len()
                ),
            });
        }

        let locals: BTreeMap<String, Value> = formula
            .params()
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect();
        let space = cells.rsplit_once('.').map(|(p, _)| p).unwrap_or(cells);
        let label = key.label();
        let scope = Scope {
            node: &label,
            space,
            locals: &locals,
        };

        stack.push(key.clone());
        let result = self.eval_expr(formula.body(), &scope, stack);
        stack.pop();
        let value = result?;

        if let Some(data) = self.cells_data_mut(cells) {
            data.cache.insert(
                key.args.clone(),
                CachedValue {
                    args,
                    value: value.clone(),
                },
            );
        }
        self.graph.touch(&key);
        if let Some(caller) = stack.last() {
            self.graph.add_edge(&key, caller);
        }
        Ok(value)
    }

    fn eval_expr(
        &mut self,
        expr: &Expr,
        scope: &Scope<'_>,
        stack: &mut Vec<NodeKey>,
    ) -> Result<Value> {
        let fail = |message: String| KernelError::Evaluation {
            node: scope.node.to_string(),
            message,
        };

        Ok(match expr {
            Expr::Literal(value) => value.clone(),
            Expr::Name(name) => self.lookup_name(name, scope).ok_or_else(|| {
                fail(format!("name '{}' is not defined", name))
            })?,
            Expr::Tuple(items) => Value::Tuple(self.eval_all(items, scope, stack)?),
            Expr::List(items) => Value::List(self.eval_all(items, scope, stack)?),
            Expr::Set(items) => {
                let mut unique: Vec<Value> = Vec::new();
                for item in self.eval_all(items, scope, stack)? {
                    if !unique.contains(&item) {
                        unique.push(item);
                    }
                }
                Value::Set(unique)
            }
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = match self.eval_expr(key, scope, stack)? {
                        Value::Str(s) => s,
                        other => {
                            return Err(fail(format!(
                                "dict keys must be str, not {}",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key, self.eval_expr(value, scope, stack)?);
                }
                Value::Dict(map)
            }
            Expr::Neg(inner) => match self.eval_expr(inner, scope, stack)? {
                Value::Int(i) => Value::Int(i.checked_neg().ok_or_else(|| fail("integer overflow".into()))?),
                Value::Bool(b) => Value::Int(-i64::from(b)),
                Value::Float(f) => Value::Float(-f),
                other => {
                    return Err(fail(format!(
                        "bad operand type for unary -: '{}'",
                        other.type_name()
                    )))
                }
            },
            Expr::Not(inner) => Value::Bool(!self.eval_expr(inner, scope, stack)?.is_truthy()),
            Expr::And(left, right) => {
                let left = self.eval_expr(left, scope, stack)?;
                if left.is_truthy() {
                    self.eval_expr(right, scope, stack)?
                } else {
                    left
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval_expr(left, scope, stack)?;
                if left.is_truthy() {
                    left
                } else {
                    self.eval_expr(right, scope, stack)?
                }
            }
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                if self.eval_expr(cond, scope, stack)?.is_truthy() {
                    self.eval_expr(then, scope, stack)?
                } else {
                    self.eval_expr(otherwise, scope, stack)?
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval_expr(left, scope, stack)?;
                let right = self.eval_expr(right, scope, stack)?;
                binary_op(*op, &left, &right).map_err(fail)?
            }
            Expr::Compare { op, left, right } => {
                let left = self.eval_expr(left, scope, stack)?;
                let right = self.eval_expr(right, scope, stack)?;
                Value::Bool(compare(*op, &left, &right).map_err(fail)?)
            }
            Expr::Index { target, index } => {
                let target = self.eval_expr(target, scope, stack)?;
                let index = self.eval_expr(index, scope, stack)?;
                subscript(&target, &index).map_err(fail)?
            }
            Expr::Call { func, args } => {
                let args = self.eval_all(args, scope, stack)?;
                let is_cells = self
                    .namespace(scope.space)
                    .is_some_and(|ns| ns.cells.contains_key(func));
                if is_cells {
                    let callee = format!("{}.{}", scope.space, func);
                    self.eval_node(&callee, args, stack)?
                } else {
                    call_builtin(func, &args).map_err(fail)?
                }
            }
        })
    }

    fn eval_all(
        &mut self,
        items: &[Expr],
        scope: &Scope<'_>,
        stack: &mut Vec<NodeKey>,
    ) -> Result<Vec<Value>> {
        items.iter().map(|item| self.eval_expr(item, scope, stack)).collect()
    }

    fn lookup_name(&self, name: &str, scope: &Scope<'_>) -> Option<Value> {
        if let Some(value) = scope.locals.get(name) {
            return Some(value.clone());
        }
        if let Some(ns) = self.namespace(scope.space) {
            if let Some(value) = ns.refs.get(name) {
                return Some(value.clone());
            }
            if ns.cells.contains_key(name) {
                return Some(Value::Object(ObjectRef::new(
                    ObjectKind::Cells,
                    format!("{}.{}", scope.space, name),
                )));
            }
            if ns.spaces.contains_key(name) {
                return Some(Value::Object(ObjectRef::new(
                    ObjectKind::Space,
                    format!("{}.{}", scope.space, name),
                )));
            }
        }
        let model = scope.space.split('.').next()?;
        self.namespace(model)?.refs.get(name).cloned()
    }

    fn object_snapshot(&self, obj: &ObjectRef, recursive: bool) -> Result<BTreeMap<String, Value>> {
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Value::str(obj.kind.type_name()));
        map.insert("name".to_string(), Value::str(obj.name()));
        map.insert("fullname".to_string(), Value::str(&obj.fullname));
        map.insert("repr".to_string(), Value::str(obj.repr()));
        if let Some(parent) = obj.parent_name() {
            map.insert("parent".to_string(), Value::str(parent));
        }

        match obj.kind {
            ObjectKind::Model | ObjectKind::Space => {
                let children = self.children(obj)?;
                map.insert(
                    "spaces".to_string(),
                    self.children_entry(&children.spaces, recursive)?,
                );
                map.insert("refs".to_string(), self.children_entry(&children.refs, recursive)?);
                if obj.kind == ObjectKind::Space {
                    map.insert(
                        "cells".to_string(),
                        self.children_entry(&children.cells, recursive)?,
                    );
                    let bases = self
                        .namespace(obj.parent_name().unwrap_or_default())
                        .and_then(|ns| ns.spaces.get(obj.name()))
                        .map(|space| space.bases.iter().map(Value::str).collect())
                        .unwrap_or_default();
                    map.insert("bases".to_string(), Value::List(bases));
                } else {
                    let current = self
                        .model(&obj.fullname)?
                        .current_space
                        .clone()
                        .map(Value::Str)
                        .unwrap_or(Value::None);
                    map.insert("current_space".to_string(), current);
                }
            }
            ObjectKind::Cells => {
                let data = self
                    .cells_data(&obj.fullname)
                    .ok_or_else(|| KernelError::not_found(&obj.fullname))?;
                map.insert("formula".to_string(), formula_snapshot(&data.formula));
            }
            ObjectKind::Reference => {
                let value = obj
                    .parent_name()
                    .and_then(|parent| self.namespace(parent))
                    .and_then(|ns| ns.refs.get(obj.name()))
                    .cloned()
                    .ok_or_else(|| KernelError::not_found(&obj.fullname))?;
                map.insert("value_type".to_string(), Value::str(value.type_name()));
                map.insert("value".to_string(), value);
            }
        }
        Ok(map)
    }

    fn children_entry(&self, children: &[ObjectRef], recursive: bool) -> Result<Value> {
        if recursive {
            let mut map = BTreeMap::new();
            for child in children {
                map.insert(
                    child.name().to_string(),
                    Value::Dict(self.object_snapshot(child, true)?),
                );
            }
            Ok(Value::Dict(map))
        } else {
            Ok(Value::Tuple(
                children.iter().map(|c| Value::str(c.name())).collect(),
            ))
        }
    }

    fn to_file(&self, model: &ModelData) -> ModelFile {
        ModelFile {
            format_version: PersistConfig::FORMAT_VERSION,
            name: model.name.clone(),
            current_space: model.current_space.clone(),
            refs: model.root.refs.clone(),
            spaces: model
                .root
                .spaces
                .iter()
                .map(|(name, space)| space_to_file(name, space))
                .collect(),
        }
    }
}

fn space_to_file(name: &str, space: &SpaceData) -> SpaceFile {
    SpaceFile {
        name: name.to_string(),
        bases: space.bases.clone(),
        cells: space
            .ns
            .cells
            .iter()
            .map(|(name, cells)| CellsFile {
                name: name.clone(),
                formula: cells.formula.source().to_string(),
            })
            .collect(),
        refs: space.ns.refs.clone(),
        spaces: space
            .ns
            .spaces
            .iter()
            .map(|(name, child)| space_to_file(name, child))
            .collect(),
    }
}

fn space_from_file(file: SpaceFile, rename: &dyn Fn(String) -> String) -> Result<SpaceData> {
    let mut ns = Namespace {
        refs: file.refs,
        ..Namespace::default()
    };
    for cells in file.cells {
        let formula = Formula::parse(&cells.formula)?;
        ns.cells.insert(cells.name, CellsData::new(formula));
    }
    for child in file.spaces {
        let name = child.name.clone();
        ns.spaces.insert(name, space_from_file(child, rename)?);
    }
    Ok(SpaceData {
        bases: file.bases.into_iter().map(rename).collect(),
        ns,
    })
}

fn formula_snapshot(formula: &Formula) -> Value {
    let mut map = BTreeMap::new();
    map.insert("source".to_string(), Value::str(formula.source()));
    map.insert(
        "params".to_string(),
        Value::Tuple(formula.params().iter().map(Value::str).collect()),
    );
    Value::Dict(map)
}

fn auto_name(prefix: &str, taken: impl Fn(&str) -> bool) -> String {
    (1..)
        .map(|n| format!("{}{}", prefix, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| prefix.to_string())
}

fn validate_name(name: &str) -> Result<()> {
    if is_identifier(name) && !name.starts_with('_') {
        Ok(())
    } else {
        Err(KernelError::engine(format!("invalid name: '{}'", name)))
    }
}

fn ensure_free(ns: &Namespace, parent: &str, name: &str) -> Result<()> {
    if ns.contains(name) {
        Err(KernelError::engine(format!(
            "{} already has a member named '{}'",
            parent, name
        )))
    } else {
        Ok(())
    }
}

impl Engine for InMemoryEngine {
    fn model_names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }

    fn current_model(&self) -> Option<ObjectRef> {
        self.current
            .as_ref()
            .map(|name| ObjectRef::new(ObjectKind::Model, name))
    }

    fn new_model(&mut self, name: Option<&str>) -> Result<ObjectRef> {
        let name = match name {
            Some(name) => {
                validate_name(name)?;
                if self.models.iter().any(|m| m.name == name) {
                    return Err(KernelError::engine(format!("model {} already exists", name)));
                }
                name.to_string()
            }
            None => auto_name(KernelConfig::AUTO_MODEL_PREFIX, |candidate| {
                self.models.iter().any(|m| m.name == candidate)
            }),
        };

        self.models.push(ModelData {
            name: name.clone(),
            root: Namespace::default(),
            current_space: None,
        });
        self.current = Some(name.clone());
        debug!("Created model {}", name);
        Ok(ObjectRef::new(ObjectKind::Model, name))
    }

    fn read_model(&mut self, path: &Path, name: Option<&str>) -> Result<ObjectRef> {
        let file = persist::load(path)?;
        let old = file.name.clone();
        let name = name.map(str::to_string).unwrap_or_else(|| old.clone());
        validate_name(&name)?;
        if self.models.iter().any(|m| m.name == name) {
            return Err(KernelError::engine(format!("model {} already exists", name)));
        }

        let old_prefix = format!("{}.", old);
        let rename = |fullname: String| match fullname.strip_prefix(&old_prefix) {
            Some(rest) => format!("{}.{}", name, rest),
            None => fullname,
        };

        let mut root = Namespace {
            refs: file.refs,
            ..Namespace::default()
        };
        for space in file.spaces {
            let space_name = space.name.clone();
            root.spaces.insert(space_name, space_from_file(space, &rename)?);
        }
        let current_space = file.current_space.map(&rename);

        self.models.push(ModelData {
            name: name.clone(),
            root,
            current_space,
        });
        self.current = Some(name.clone());
        info!("Read model {} from {}", name, path.display());
        Ok(ObjectRef::new(ObjectKind::Model, name))
    }

    fn write_model(&self, model: &str, path: &Path, backup: bool, archive: bool) -> Result<()> {
        let data = self.model(model)?;
        persist::save(&self.to_file(data), path, backup, archive)
    }

    fn close_model(&mut self, name: &str) -> Result<()> {
        let index = self
            .models
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| KernelError::not_found(name))?;
        self.clear_within(name);
        self.models.remove(index);
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
        debug!("Closed model {}", name);
        Ok(())
    }

    fn get_model(&self, name: &str) -> Result<ObjectRef> {
        self.model(name)
            .map(|m| ObjectRef::new(ObjectKind::Model, &m.name))
    }

    fn resolve(&self, fullname: &str) -> Result<ObjectRef> {
        let not_found = || KernelError::not_found(fullname);
        let segments: Vec<&str> = fullname.split('.').collect();
        let model = self
            .models
            .iter()
            .find(|m| m.name == segments[0])
            .ok_or_else(not_found)?;

        let mut ns = &model.root;
        let mut kind = ObjectKind::Model;
        for (i, segment) in segments.iter().enumerate().skip(1) {
            let last = i == segments.len() - 1;
            if let Some(space) = ns.spaces.get(*segment) {
                ns = &space.ns;
                kind = ObjectKind::Space;
            } else if last && ns.cells.contains_key(*segment) {
                kind = ObjectKind::Cells;
            } else if last && ns.refs.contains_key(*segment) {
                kind = ObjectKind::Reference;
            } else {
                return Err(not_found());
            }
        }
        Ok(ObjectRef::new(kind, fullname))
    }

    fn resolve_in(&self, scope: &ObjectRef, name: &str) -> Result<ObjectRef> {
        self.resolve(&scope.child_name(name))
    }

    fn current_space(&self, model: &ObjectRef) -> Option<ObjectRef> {
        let fullname = self.model(&model.fullname).ok()?.current_space.clone()?;
        self.resolve(&fullname)
            .ok()
            .filter(|obj| obj.kind == ObjectKind::Space)
    }

    fn new_space(
        &mut self,
        parent: &ObjectRef,
        name: Option<&str>,
        bases: &[ObjectRef],
    ) -> Result<ObjectRef> {
        let mut inherited = Namespace::default();
        let mut base_names = Vec::new();
        for base in bases {
            let base = self.expect_kind(base, &[ObjectKind::Space])?;
            let ns = self
                .namespace(&base.fullname)
                .ok_or_else(|| KernelError::not_found(&base.fullname))?;
            for (cells_name, cells) in &ns.cells {
                inherited
                    .cells
                    .entry(cells_name.clone())
                    .or_insert_with(|| CellsData {
                        formula: Arc::clone(&cells.formula),
                        cache: BTreeMap::new(),
                    });
            }
            for (ref_name, value) in &ns.refs {
                inherited
                    .refs
                    .entry(ref_name.clone())
                    .or_insert_with(|| value.clone());
            }
            base_names.push(base.fullname);
        }

        let parent_name = parent.fullname.clone();
        let ns = self.parent_namespace_mut(parent)?;
        let name = match name {
            Some(name) => {
                validate_name(name)?;
                ensure_free(ns, &parent_name, name)?;
                name.to_string()
            }
            None => auto_name(KernelConfig::AUTO_SPACE_PREFIX, |c| ns.contains(c)),
        };
        ns.spaces.insert(
            name.clone(),
            SpaceData {
                bases: base_names,
                ns: inherited,
            },
        );

        let space = ObjectRef::new(ObjectKind::Space, format!("{}.{}", parent_name, name));
        let model = self.model_mut(space.model_name())?;
        model.current_space = Some(space.fullname.clone());
        debug!("Created space {}", space.fullname);
        Ok(space)
    }

    fn new_cells(
        &mut self,
        parent: &ObjectRef,
        name: Option<&str>,
        formula: Option<&str>,
    ) -> Result<ObjectRef> {
        self.expect_kind(parent, &[ObjectKind::Space])?;
        let parsed = match formula {
            Some(source) => Some(Formula::parse(source)?),
            None => None,
        };

        let parent_name = parent.fullname.clone();
        let ns = self.parent_namespace_mut(parent)?;

        let (name, formula) = match (name, parsed) {
            (Some(name), Some(formula)) => (name.to_string(), formula.renamed(name)),
            (Some(name), None) => (name.to_string(), Formula::stub()),
            (None, Some(formula)) => {
                let name = match formula.name() {
                    Some(declared) => declared.to_string(),
                    None => auto_name(KernelConfig::AUTO_CELLS_PREFIX, |c| ns.contains(c)),
                };
                (name, formula)
            }
            (None, None) => (
                auto_name(KernelConfig::AUTO_CELLS_PREFIX, |c| ns.contains(c)),
                Formula::stub(),
            ),
        };
        validate_name(&name)?;
        ensure_free(ns, &parent_name, &name)?;
        ns.cells.insert(name.clone(), CellsData::new(formula));

        let cells = ObjectRef::new(ObjectKind::Cells, format!("{}.{}", parent_name, name));
        debug!("Created cells {}", cells.fullname);
        Ok(cells)
    }

    fn set_ref(&mut self, parent: &ObjectRef, name: &str, value: Value) -> Result<ObjectRef> {
        validate_name(name)?;
        let parent_name = parent.fullname.clone();
        let ns = self.parent_namespace_mut(parent)?;
        if ns.spaces.contains_key(name) || ns.cells.contains_key(name) {
            return Err(KernelError::engine(format!(
                "{} already has a member named '{}'",
                parent_name, name
            )));
        }
        ns.refs.insert(name.to_string(), value);

        let reference = ObjectRef::new(ObjectKind::Reference, format!("{}.{}", parent_name, name));
        self.clear_within(reference.model_name());
        Ok(reference)
    }

    fn delete_child(&mut self, parent: &ObjectRef, name: &str) -> Result<()> {
        let fullname = parent.child_name(name);
        let ns = self.parent_namespace_mut(parent)?;
        let kind = if ns.spaces.remove(name).is_some() {
            ObjectKind::Space
        } else if ns.cells.remove(name).is_some() {
            ObjectKind::Cells
        } else if ns.refs.remove(name).is_some() {
            ObjectKind::Reference
        } else {
            return Err(KernelError::not_found(fullname));
        };

        let child = ObjectRef::new(kind, &fullname);
        match kind {
            ObjectKind::Reference => self.clear_within(child.model_name()),
            _ => self.clear_within(&fullname),
        }

        let model = self.model_mut(child.model_name())?;
        let current_removed = model.current_space.as_deref().is_some_and(|current| {
            current == fullname || current.starts_with(&format!("{}.", fullname))
        });
        if current_removed {
            model.current_space = None;
        }
        debug!("Deleted {}", child);
        Ok(())
    }

    fn set_formula(&mut self, cells: &ObjectRef, formula: &str) -> Result<()> {
        let cells = self.expect_kind(cells, &[ObjectKind::Cells])?;
        let formula = Formula::parse(formula)?.renamed(cells.name());
        let data = self
            .cells_data_mut(&cells.fullname)
            .ok_or_else(|| KernelError::not_found(&cells.fullname))?;
        data.formula = Arc::new(formula);
        data.cache.clear();
        self.clear_within(&cells.fullname);
        Ok(())
    }

    fn children(&self, obj: &ObjectRef) -> Result<Children> {
        let obj = self.resolve(&obj.fullname)?;
        if !matches!(obj.kind, ObjectKind::Model | ObjectKind::Space) {
            return Ok(Children::default());
        }
        let ns = self
            .namespace(&obj.fullname)
            .ok_or_else(|| KernelError::not_found(&obj.fullname))?;
        let refs_of = |kind: ObjectKind, names: Vec<&String>| -> Vec<ObjectRef> {
            names
                .into_iter()
                .map(|name| ObjectRef::new(kind, obj.child_name(name)))
                .collect()
        };
        Ok(Children {
            spaces: refs_of(ObjectKind::Space, ns.spaces.keys().collect()),
            cells: refs_of(ObjectKind::Cells, ns.cells.keys().collect()),
            refs: refs_of(ObjectKind::Reference, ns.refs.keys().collect()),
        })
    }

    fn snapshot(
        &self,
        obj: &ObjectRef,
        attrs: Option<&[String]>,
        recursive: bool,
    ) -> Result<Value> {
        let obj = self.resolve(&obj.fullname)?;
        let mut map = self.object_snapshot(&obj, recursive)?;
        if let Some(attrs) = attrs {
            map.retain(|key, _| {
                key == "type" || key == "fullname" || attrs.iter().any(|a| a == key)
            });
        }
        Ok(Value::Dict(map))
    }

    fn lookup(&self, obj: &ObjectRef, args: &[Value]) -> Result<Lookup> {
        let obj = self.resolve(&obj.fullname)?;
        match obj.kind {
            ObjectKind::Reference => {
                let value = obj
                    .parent_name()
                    .and_then(|parent| self.namespace(parent))
                    .and_then(|ns| ns.refs.get(obj.name()))
                    .cloned()
                    .ok_or_else(|| KernelError::not_found(&obj.fullname))?;
                Ok(Lookup::Found(value))
            }
            ObjectKind::Cells => {
                let key = NodeKey::new(&obj.fullname, args);
                let data = self
                    .cells_data(&obj.fullname)
                    .ok_or_else(|| KernelError::not_found(&obj.fullname))?;
                Ok(match data.cache.get(&key.args) {
                    Some(cached) => Lookup::Found(cached.value.clone()),
                    None => Lookup::NeedsComputation,
                })
            }
            ObjectKind::Model | ObjectKind::Space => Ok(Lookup::NotFound),
        }
    }

    fn evaluate(&mut self, node: &NodeRef) -> Result<Value> {
        let cells = self.expect_kind(&node.cells, &[ObjectKind::Cells])?;
        let mut stack = Vec::new();
        self.eval_node(&cells.fullname, node.args.clone(), &mut stack)
    }

    fn node_snapshot(&self, node: &NodeRef, extattrs: &[&str]) -> Result<Value> {
        let cells = self.expect_kind(&node.cells, &[ObjectKind::Cells])?;
        let data = self
            .cells_data(&cells.fullname)
            .ok_or_else(|| KernelError::not_found(&cells.fullname))?;
        let key = NodeKey::new(&cells.fullname, &node.args);

        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Value::str("ItemNode"));
        map.insert("obj".to_string(), Value::Dict(self.object_snapshot(&cells, false)?));
        map.insert("args".to_string(), Value::Tuple(node.args.clone()));
        map.insert(
            "repr".to_string(),
            Value::str(format!("{}{}", cells.fullname, node.args_repr())),
        );

        let cached = data.cache.get(&key.args);
        map.insert("has_value".to_string(), Value::Bool(cached.is_some()));
        if let Some(cached) = cached {
            map.insert("value".to_string(), cached.value.clone());
        }
        for attr in extattrs {
            if *attr == "formula" {
                map.insert("formula".to_string(), formula_snapshot(&data.formula));
            }
        }
        Ok(Value::Dict(map))
    }

    fn adjacent(&self, node: &NodeRef, adjacency: Adjacency) -> Result<Vec<NodeRef>> {
        let cells = self.expect_kind(&node.cells, &[ObjectKind::Cells])?;
        let key = NodeKey::new(&cells.fullname, &node.args);

        Ok(self
            .graph
            .neighbors(&key, adjacency)
            .into_iter()
            .filter_map(|neighbor| {
                let cached = self.cells_data(&neighbor.cells)?.cache.get(&neighbor.args)?;
                Some(NodeRef::new(
                    ObjectRef::new(ObjectKind::Cells, &neighbor.cells),
                    cached.args.clone(),
                ))
            })
            .collect())
    }

    fn assoc_values(&self, model: &str) -> Result<Vec<AssocValue>> {
        let data = self.model(model)?;
        let mut values: Vec<AssocValue> = Vec::new();

        let mut pending: Vec<(String, &Namespace)> = vec![(data.name.clone(), &data.root)];
        while let Some((prefix, ns)) = pending.pop() {
            for (name, value) in &ns.refs {
                let reference =
                    ObjectRef::new(ObjectKind::Reference, format!("{}.{}", prefix, name));
                match values.iter_mut().find(|entry| entry.value == *value) {
                    Some(entry) => entry.refs.push(reference),
                    None => values.push(AssocValue {
                        value: value.clone(),
                        spec: resource_spec(value),
                        refs: vec![reference],
                    }),
                }
            }
            for (name, space) in ns.spaces.iter().rev() {
                pending.push((format!("{}.{}", prefix, name), &space.ns));
            }
        }
        Ok(values)
    }
}

/// Spec snapshot for values backed by an I/O resource.
fn resource_spec(value: &Value) -> Option<Value> {
    match value {
        Value::Resource(repr) => {
            let mut map = BTreeMap::new();
            map.insert("type".to_string(), Value::str("IOSpec"));
            map.insert("repr".to_string(), Value::str(repr));
            map.insert("value".to_string(), value.clone());
            Some(Value::Dict(map))
        }
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn type_error(op: &str, left: &Value, right: &Value) -> String {
    format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        left.type_name(),
        right.type_name()
    )
}

fn binary_op(op: BinOp, left: &Value, right: &Value) -> std::result::Result<Value, String> {
    let symbol = match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::Pow => "**",
    };
    let overflow = || "integer overflow".to_string();

    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{}{}", a, b))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            return Ok(Value::List(a.iter().chain(b).cloned().collect()))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            return Ok(Value::Tuple(a.iter().chain(b).cloned().collect()))
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if as_int(n).is_some() => {
            let count = usize::try_from(as_int(n).unwrap_or(0)).unwrap_or(0);
            return Ok(Value::Str(s.repeat(count)));
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if as_int(n).is_some() =>
        {
            let count = usize::try_from(as_int(n).unwrap_or(0)).unwrap_or(0);
            return Ok(Value::List(
                std::iter::repeat(items.iter().cloned()).take(count).flatten().collect(),
            ));
        }
        _ => {}
    }

    if let (Some(a), Some(b)) = (as_int(left), as_int(right)) {
        return match op {
            BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Div if b == 0 => Err("division by zero".to_string()),
            BinOp::Div => Ok(Value::Float(a as f64 / b as f64)),
            BinOp::FloorDiv | BinOp::Mod if b == 0 => {
                Err("integer division or modulo by zero".to_string())
            }
            BinOp::FloorDiv => {
                let q = a.checked_div(b).ok_or_else(overflow)?;
                Ok(Value::Int(if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q }))
            }
            BinOp::Mod => {
                let r = a.checked_rem(b).ok_or_else(overflow)?;
                Ok(Value::Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }))
            }
            BinOp::Pow if b >= 0 => {
                let exp = u32::try_from(b).map_err(|_| overflow())?;
                a.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
            }
            BinOp::Pow => Ok(Value::Float((a as f64).powf(b as f64))),
        };
    }

    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => match op {
            BinOp::Add => Ok(Value::Float(a + b)),
            BinOp::Sub => Ok(Value::Float(a - b)),
            BinOp::Mul => Ok(Value::Float(a * b)),
            BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => {
                Err("float division by zero".to_string())
            }
            BinOp::Div => Ok(Value::Float(a / b)),
            BinOp::FloorDiv => Ok(Value::Float((a / b).floor())),
            BinOp::Mod => Ok(Value::Float(a - b * (a / b).floor())),
            BinOp::Pow => Ok(Value::Float(a.powf(b))),
        },
        _ => Err(type_error(symbol, left, right)),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> std::result::Result<bool, String> {
    let equal = match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    };
    match op {
        CmpOp::Eq => return Ok(equal),
        CmpOp::NotEq => return Ok(!equal),
        _ => {}
    }

    let ordering = match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => {
                return Err(format!(
                    "comparison not supported between instances of '{}' and '{}'",
                    left.type_name(),
                    right.type_name()
                ))
            }
        },
    };
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::LtEq => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::GtEq => ordering != Ordering::Less,
        CmpOp::Eq | CmpOp::NotEq => unreachable!("equality handled above"),
    })
}

fn subscript(target: &Value, index: &Value) -> std::result::Result<Value, String> {
    let position = |len: usize| -> std::result::Result<usize, String> {
        let i = as_int(index).ok_or_else(|| {
            format!("indices must be integers, not {}", index.type_name())
        })?;
        let len = i64::try_from(len).map_err(|_| "sequence too long".to_string())?;
        let resolved = if i < 0 { i + len } else { i };
        if (0..len).contains(&resolved) {
            Ok(resolved as usize)
        } else {
            Err("index out of range".to_string())
        }
    };

    match target {
        Value::List(items) | Value::Tuple(items) => Ok(items[position(items.len())?].clone()),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(chars[position(chars.len())?].to_string()))
        }
        Value::Dict(map) => {
            let key = index
                .as_str()
                .ok_or_else(|| format!("dict keys must be str, not {}", index.type_name()))?;
            map.get(key).cloned().ok_or_else(|| format!("key not found: {}", index.repr()))
        }
        other => Err(format!("'{}' object is not subscriptable", other.type_name())),
    }
}

fn call_builtin(name: &str, args: &[Value]) -> std::result::Result<Value, String> {
    // A single sequence argument spreads into its items for aggregates.
    let items: &[Value] = match args {
        [single] => single.as_sequence().unwrap_or(args),
        _ => args,
    };

    match name {
        "abs" => match args {
            [Value::Int(i)] => i.checked_abs().map(Value::Int).ok_or_else(|| "integer overflow".to_string()),
            [value] => as_number(value)
                .map(|f| Value::Float(f.abs()))
                .ok_or_else(|| format!("bad operand type for abs(): '{}'", value.type_name())),
            _ => Err("abs() takes exactly one argument".to_string()),
        },
        "min" | "max" => {
            let mut best: Option<&Value> = None;
            for item in items {
                best = match best {
                    None => Some(item),
                    Some(current) => {
                        let op = if name == "min" { CmpOp::Lt } else { CmpOp::Gt };
                        if compare(op, item, current)? {
                            Some(item)
                        } else {
                            Some(current)
                        }
                    }
                };
            }
            best.cloned().ok_or_else(|| format!("{}() arg is an empty sequence", name))
        }
        "sum" => items.iter().try_fold(Value::Int(0), |acc, item| binary_op(BinOp::Add, &acc, item)),
        "len" => match args {
            [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
            [Value::List(items)] | [Value::Tuple(items)] | [Value::Set(items)] => Ok(Value::Int(items.len() as i64)),
            [Value::Dict(map)] => Ok(Value::Int(map.len() as i64)),
            [value] => Err(format!("object of type '{}' has no len()", value.type_name())),
            _ => Err("len() takes exactly one argument".to_string()),
        },
        "round" => {
            let (value, digits) = match args {
                [value] => (value, None),
                [value, digits] => (value, as_int(digits)),
                _ => return Err("round() takes one or two arguments".to_string()),
            };
            let number = as_number(value)
                .ok_or_else(|| format!("type {} doesn't define __round__", value.type_name()))?;
            match digits {
                None => Ok(Value::Int(number.round_ties_even() as i64)),
                Some(d) => {
                    let exp = i32::try_from(d).map_err(|_| "ndigits out of range".to_string())?;
                    let scale = 10f64.powi(exp);
                    Ok(Value::Float((number * scale).round_ties_even() / scale))
                }
            }
        }
        "int" => match args {
            [Value::Str(s)] => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("invalid literal for int(): {}", s)),
            [value] => as_number(value)
                .map(|f| Value::Int(f.trunc() as i64))
                .ok_or_else(|| format!("int() argument must be a number, not '{}'", value.type_name())),
            _ => Err("int() takes exactly one argument".to_string()),
        },
        "float" => match args {
            [Value::Str(s)] => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("could not convert string to float: {}", s)),
            [value] => as_number(value)
                .map(Value::Float)
                .ok_or_else(|| format!("float() argument must be a number, not '{}'", value.type_name())),
            _ => Err("float() takes exactly one argument".to_string()),
        },
        "str" => match args {
            [Value::Str(s)] => Ok(Value::Str(s.clone())),
            [value] => Ok(Value::Str(value.repr())),
            _ => Err("str() takes exactly one argument".to_string()),
        },
        _ => Err(format!("name '{}' is not defined", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine_with_space() -> (InMemoryEngine, ObjectRef) {
        let mut engine = InMemoryEngine::new();
        let model = engine.new_model(Some("Model1")).unwrap();
        let space = engine.new_space(&model, Some("Space1"), &[]).unwrap();
        (engine, space)
    }

    fn node(cells: &ObjectRef, args: Vec<Value>) -> NodeRef {
        NodeRef::new(cells.clone(), args)
    }

    #[test]
    fn test_auto_names() {
        let mut engine = InMemoryEngine::new();
        let model = engine.new_model(None).unwrap();
        assert_eq!(model.fullname, "Model1");
        assert_eq!(engine.new_model(None).unwrap().fullname, "Model2");

        let space = engine.new_space(&model, None, &[]).unwrap();
        assert_eq!(space.fullname, "Model1.Space1");
        let cells = engine.new_cells(&space, None, None).unwrap();
        assert_eq!(cells.fullname, "Model1.Space1.Cells1");
        let cells = engine.new_cells(&space, None, Some("lambda x: x")).unwrap();
        assert_eq!(cells.fullname, "Model1.Space1.Cells2");
    }

    #[test]
    fn test_cells_naming_follows_formula() {
        let (mut engine, space) = engine_with_space();
        let foo = engine.new_cells(&space, None, Some("def foo(x): return x")).unwrap();
        assert_eq!(foo.name(), "foo");

        let bar = engine.new_cells(&space, Some("bar"), Some("def foo(): return 1")).unwrap();
        let snapshot = engine.snapshot(&bar, Some(&["formula".to_string()]), false).unwrap();
        let formula = snapshot.as_dict().unwrap()["formula"].as_dict().unwrap().clone();
        assert_eq!(formula["source"], Value::str("def bar(): return 1"));

        let stub = engine.new_cells(&space, Some("baz"), None).unwrap();
        assert_eq!(engine.evaluate(&node(&stub, vec![])).unwrap(), Value::None);
    }

    #[test]
    fn test_duplicate_and_invalid_names() {
        let (mut engine, space) = engine_with_space();
        engine.new_cells(&space, Some("foo"), None).unwrap();
        assert!(engine.new_cells(&space, Some("foo"), None).is_err());
        assert!(engine.new_cells(&space, Some("1x"), None).is_err());
        assert!(engine.new_model(Some("Model1")).is_err());

        let model = engine.get_model("Model1").unwrap();
        assert!(engine.new_cells(&model, Some("top"), None).is_err());
    }

    #[test]
    fn test_evaluation_and_cache() {
        let (mut engine, space) = engine_with_space();
        let fib = engine
            .new_cells(
                &space,
                None,
                Some("def fib(n):\n    return n if n < 2 else fib(n - 1) + fib(n - 2)"),
            )
            .unwrap();

        assert_eq!(
            engine.lookup(&fib, &[Value::Int(10)]).unwrap(),
            Lookup::NeedsComputation
        );
        assert_eq!(engine.evaluate(&node(&fib, vec![Value::Int(10)])).unwrap(), Value::Int(55));
        assert_eq!(
            engine.lookup(&fib, &[Value::Int(10)]).unwrap(),
            Lookup::Found(Value::Int(55))
        );
        assert_eq!(
            engine.lookup(&fib, &[Value::Int(3)]).unwrap(),
            Lookup::Found(Value::Int(2))
        );
    }

    #[test]
    fn test_refs_are_visible_to_formulas() {
        let (mut engine, space) = engine_with_space();
        let model = engine.get_model("Model1").unwrap();
        engine.set_ref(&model, "rate", Value::Float(0.5)).unwrap();
        engine.set_ref(&space, "base", Value::Int(10)).unwrap();
        let cells = engine
            .new_cells(&space, Some("val"), Some("lambda t: base * rate ** t"))
            .unwrap();
        assert_eq!(
            engine.evaluate(&node(&cells, vec![Value::Int(2)])).unwrap(),
            Value::Float(2.5)
        );
    }

    #[test]
    fn test_lookup_on_reference_and_space() {
        let (mut engine, space) = engine_with_space();
        let reference = engine.set_ref(&space, "x", Value::str("a")).unwrap();
        assert_eq!(engine.lookup(&reference, &[]).unwrap(), Lookup::Found(Value::str("a")));
        assert_eq!(engine.lookup(&space, &[]).unwrap(), Lookup::NotFound);
    }

    #[test]
    fn test_dependency_graph() {
        let (mut engine, space) = engine_with_space();
        let a = engine.new_cells(&space, None, Some("def a(x): return b(x) + 1")).unwrap();
        let b = engine.new_cells(&space, None, Some("def b(x): return x * 2")).unwrap();
        engine.evaluate(&node(&a, vec![Value::Int(1)])).unwrap();

        let preds = engine.adjacent(&node(&a, vec![Value::Int(1)]), Adjacency::Predecessors).unwrap();
        assert_eq!(preds, vec![node(&b, vec![Value::Int(1)])]);

        let succs = engine.adjacent(&node(&b, vec![Value::Int(1)]), Adjacency::Successors).unwrap();
        assert_eq!(succs, vec![node(&a, vec![Value::Int(1)])]);

        let none = engine.adjacent(&node(&a, vec![Value::Int(9)]), Adjacency::Predecessors).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_set_formula_clears_dependents() {
        let (mut engine, space) = engine_with_space();
        let a = engine.new_cells(&space, None, Some("def a(): return b() + 1")).unwrap();
        let b = engine.new_cells(&space, None, Some("def b(): return 1")).unwrap();
        assert_eq!(engine.evaluate(&node(&a, vec![])).unwrap(), Value::Int(2));

        engine.set_formula(&b, "def b(): return 10").unwrap();
        assert_eq!(engine.lookup(&a, &[]).unwrap(), Lookup::NeedsComputation);
        assert_eq!(engine.evaluate(&node(&a, vec![])).unwrap(), Value::Int(11));
    }

    #[test]
    fn test_cycle_is_an_evaluation_error() {
        let (mut engine, space) = engine_with_space();
        let a = engine.new_cells(&space, None, Some("def a(): return b()")).unwrap();
        engine.new_cells(&space, None, Some("def b(): return a()")).unwrap();
        let err = engine.evaluate(&node(&a, vec![])).unwrap_err();
        assert!(matches!(err, KernelError::Evaluation { ref message, .. } if message == "cyclic reference"));
        assert_eq!(engine.lookup(&a, &[]).unwrap(), Lookup::NeedsComputation);
    }

    #[test]
    fn test_depth_limit() {
        // Debug builds need more than the default test thread stack here.
        let handle = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(|| {
                let (mut engine, space) = engine_with_space();
                let deep = engine
                    .new_cells(
                        &space,
                        None,
                        Some("def deep(n): return 0 if n == 0 else deep(n - 1)"),
                    )
                    .unwrap();
                let limit = KernelConfig::MAX_EVAL_DEPTH as i64;
                let err = engine
                    .evaluate(&node(&deep, vec![Value::Int(limit + 5)]))
                    .unwrap_err();
                assert!(matches!(err, KernelError::Evaluation { .. }));
                assert_eq!(
                    engine.evaluate(&node(&deep, vec![Value::Int(10)])).unwrap(),
                    Value::Int(0)
                );
            })
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_runtime_errors() {
        let (mut engine, space) = engine_with_space();
        let bad = engine.new_cells(&space, None, Some("def bad(): return 1 / 0")).unwrap();
        assert!(matches!(
            engine.evaluate(&node(&bad, vec![])),
            Err(KernelError::Evaluation { .. })
        ));
        let undefined = engine.new_cells(&space, None, Some("def u(): return nothing")).unwrap();
        assert!(engine.evaluate(&node(&undefined, vec![])).is_err());
        let arity = engine.new_cells(&space, None, Some("def one(x): return x")).unwrap();
        assert!(engine.evaluate(&node(&arity, vec![])).is_err());
    }

    #[test]
    fn test_python_arithmetic() {
        let i = Value::Int;
        assert_eq!(binary_op(BinOp::FloorDiv, &i(-7), &i(2)).unwrap(), i(-4));
        assert_eq!(binary_op(BinOp::Mod, &i(-7), &i(2)).unwrap(), i(1));
        assert_eq!(binary_op(BinOp::Div, &i(7), &i(2)).unwrap(), Value::Float(3.5));
        assert_eq!(binary_op(BinOp::Pow, &i(2), &i(-1)).unwrap(), Value::Float(0.5));
        assert_eq!(
            binary_op(BinOp::Add, &Value::str("a"), &Value::str("b")).unwrap(),
            Value::str("ab")
        );
        assert!(binary_op(BinOp::Add, &Value::str("a"), &i(1)).is_err());
        assert!(compare(CmpOp::Eq, &i(1), &Value::Float(1.0)).unwrap());
        assert!(compare(CmpOp::Lt, &Value::None, &i(1)).is_err());
    }

    #[test]
    fn test_builtins() {
        let items = Value::List(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert_eq!(call_builtin("max", &[items.clone()]).unwrap(), Value::Int(3));
        assert_eq!(call_builtin("min", &[Value::Int(4), Value::Int(2)]).unwrap(), Value::Int(2));
        assert_eq!(call_builtin("sum", &[items.clone()]).unwrap(), Value::Int(6));
        assert_eq!(call_builtin("len", &[items]).unwrap(), Value::Int(3));
        assert_eq!(call_builtin("round", &[Value::Float(2.5)]).unwrap(), Value::Int(2));
        assert!(call_builtin("open", &[]).is_err());
    }

    #[test]
    fn test_delete_child() {
        let (mut engine, space) = engine_with_space();
        let a = engine.new_cells(&space, None, Some("def a(): return b()")).unwrap();
        engine.new_cells(&space, None, Some("def b(): return 1")).unwrap();
        engine.evaluate(&node(&a, vec![])).unwrap();

        engine.delete_child(&space, "b").unwrap();
        assert_eq!(engine.lookup(&a, &[]).unwrap(), Lookup::NeedsComputation);
        assert!(matches!(engine.resolve("Model1.Space1.b"), Err(KernelError::Resolution { .. })));
        assert!(matches!(
            engine.delete_child(&space, "b"),
            Err(KernelError::Resolution { .. })
        ));

        let model = engine.get_model("Model1").unwrap();
        engine.delete_child(&model, "Space1").unwrap();
        assert!(engine.current_space(&model).is_none());
    }

    #[test]
    fn test_bases_are_inherited() {
        let (mut engine, base) = engine_with_space();
        engine.new_cells(&base, None, Some("def foo(): return 1")).unwrap();
        engine.set_ref(&base, "x", Value::Int(2)).unwrap();

        let model = engine.get_model("Model1").unwrap();
        let derived = engine.new_space(&model, Some("Derived"), &[base.clone()]).unwrap();
        assert_eq!(engine.resolve("Model1.Derived.foo").unwrap().kind, ObjectKind::Cells);
        assert_eq!(engine.resolve("Model1.Derived.x").unwrap().kind, ObjectKind::Reference);

        let snapshot = engine.snapshot(&derived, None, false).unwrap();
        assert_eq!(
            snapshot.as_dict().unwrap()["bases"],
            Value::List(vec![Value::str("Model1.Space1")])
        );
        assert_eq!(engine.current_space(&model), Some(derived));
    }

    #[test]
    fn test_snapshot_shapes() {
        let (mut engine, space) = engine_with_space();
        engine.new_cells(&space, Some("foo"), None).unwrap();
        let model = engine.get_model("Model1").unwrap();

        let flat = engine.snapshot(&model, None, false).unwrap();
        let flat = flat.as_dict().unwrap();
        assert_eq!(flat["type"], Value::str("Model"));
        assert_eq!(flat["spaces"], Value::tuple([Value::str("Space1")]));

        let deep = engine.snapshot(&model, None, true).unwrap();
        let spaces = deep.as_dict().unwrap()["spaces"].as_dict().unwrap().clone();
        let cells = spaces["Space1"].as_dict().unwrap()["cells"].as_dict().unwrap().clone();
        assert!(cells.contains_key("foo"));

        let only = engine.snapshot(&space, Some(&["bases".to_string()]), false).unwrap();
        let keys: Vec<&String> = only.as_dict().unwrap().keys().collect();
        assert_eq!(keys, vec!["bases", "fullname", "type"]);
    }

    #[test]
    fn test_node_snapshot() {
        let (mut engine, space) = engine_with_space();
        let sq = engine.new_cells(&space, None, Some("lambda x: x * x")).unwrap();
        let n = node(&sq, vec![Value::Int(3)]);

        let before = engine.node_snapshot(&n, &[]).unwrap();
        assert_eq!(before.as_dict().unwrap()["has_value"], Value::Bool(false));
        assert!(!before.as_dict().unwrap().contains_key("value"));

        engine.evaluate(&n).unwrap();
        let after = engine.node_snapshot(&n, &["formula"]).unwrap();
        let after = after.as_dict().unwrap();
        assert_eq!(after["value"], Value::Int(9));
        assert_eq!(after["args"], Value::tuple([Value::Int(3)]));
        assert!(after.contains_key("formula"));
    }

    #[test]
    fn test_numerically_equal_args_share_a_node() {
        let (mut engine, space) = engine_with_space();
        let foo = engine.new_cells(&space, None, Some("lambda x: x * 10")).unwrap();
        assert_eq!(engine.evaluate(&node(&foo, vec![Value::Int(1)])).unwrap(), Value::Int(10));

        for arg in [Value::Float(1.0), Value::Bool(true)] {
            assert_eq!(
                engine.lookup(&foo, &[arg.clone()]).unwrap(),
                Lookup::Found(Value::Int(10))
            );
            let snapshot = engine.node_snapshot(&node(&foo, vec![arg.clone()]), &[]).unwrap();
            let snapshot = snapshot.as_dict().unwrap();
            assert_eq!(snapshot["has_value"], Value::Bool(true));
            assert_eq!(snapshot["args"], Value::tuple([arg]));
        }
        assert_eq!(
            engine.lookup(&foo, &[Value::Float(1.5)]).unwrap(),
            Lookup::NeedsComputation
        );
        assert_eq!(
            engine.lookup(&foo, &[Value::Str("1".to_string())]).unwrap(),
            Lookup::NeedsComputation
        );
    }

    #[test]
    fn test_key_form_folds_nested_numbers() {
        let args = Value::tuple([Value::Float(-0.0), Value::Bool(false), Value::Float(2.5)]);
        assert_eq!(
            key_form(&args),
            Value::tuple([Value::Int(0), Value::Int(0), Value::Float(2.5)])
        );
        assert!(matches!(key_form(&Value::Float(f64::NAN)), Value::Float(f) if f.is_nan()));
        assert_eq!(key_form(&Value::Float(1e300)), Value::Float(1e300));
    }

    #[test]
    fn test_assoc_values_group_refs() {
        let (mut engine, space) = engine_with_space();
        let model = engine.get_model("Model1").unwrap();
        let resource = Value::Resource("<ExcelRange 'data.xlsx'!A1:B2>".to_string());
        engine.set_ref(&model, "table", resource.clone()).unwrap();
        engine.set_ref(&space, "same", resource.clone()).unwrap();
        engine.set_ref(&space, "n", Value::Int(1)).unwrap();

        let values = engine.assoc_values("Model1").unwrap();
        assert_eq!(values.len(), 2);
        let shared = values.iter().find(|v| v.value == resource).unwrap();
        assert_eq!(shared.refs.len(), 2);
        assert!(shared.spec.is_some());
        let plain = values.iter().find(|v| v.value == Value::Int(1)).unwrap();
        assert!(plain.spec.is_none());
    }

    #[test]
    fn test_close_model() {
        let (mut engine, _) = engine_with_space();
        engine.close_model("Model1").unwrap();
        assert!(engine.current_model().is_none());
        assert!(engine.model_names().is_empty());
        assert!(matches!(engine.close_model("Model1"), Err(KernelError::Resolution { .. })));
    }

    #[test]
    fn test_write_and_read_model() {
        let temp = TempDir::new().unwrap();
        let (mut engine, space) = engine_with_space();
        let base = space.clone();
        engine.new_cells(&space, None, Some("def foo(x): return x + 1")).unwrap();
        engine.set_ref(&space, "k", Value::tuple([Value::Int(1)])).unwrap();
        let model = engine.get_model("Model1").unwrap();
        engine.new_space(&model, Some("Child"), &[base]).unwrap();

        for archive in [false, true] {
            let path = temp.path().join(if archive { "m.zip" } else { "m" });
            engine.write_model("Model1", &path, false, archive).unwrap();

            let copy = if archive { "Zipped" } else { "Copy" };
            let loaded = engine.read_model(&path, Some(copy)).unwrap();
            assert_eq!(engine.current_model(), Some(loaded));

            let foo = engine.resolve(&format!("{}.Space1.foo", copy)).unwrap();
            assert_eq!(engine.evaluate(&node(&foo, vec![Value::Int(1)])).unwrap(), Value::Int(2));

            let child = engine.resolve(&format!("{}.Child", copy)).unwrap();
            let snapshot = engine.snapshot(&child, None, false).unwrap();
            assert_eq!(
                snapshot.as_dict().unwrap()["bases"],
                Value::List(vec![Value::str(format!("{}.Space1", copy))])
            );
        }

        let path = temp.path().join("m");
        assert!(engine.read_model(&path, None).is_err());
    }
}
