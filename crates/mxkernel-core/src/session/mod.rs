//! Front-end session: operation dispatch, user variables and notifications.

pub mod args;
pub mod handlers;
pub mod registry;
pub mod shell;

pub use args::CallArgs;
pub use registry::{CapabilitySet, Handler, Registry, Reply};

use crate::codec::Payload;
use crate::config::ChannelConfig;
use crate::display::display_value_entry;
use crate::engine::Engine;
use crate::error::{KernelError, Result};
use crate::notify::Publisher;
use crate::value::{ObjectRef, Value};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Capability sets of a full session, ancestors first.
pub const DEFAULT_CAPABILITIES: &[CapabilitySet] =
    &[shell::CAPABILITIES, handlers::CAPABILITIES];

/// One handler set bound to one front-end channel.
pub struct Session {
    engine: Box<dyn Engine>,
    vars: BTreeMap<String, Value>,
    publisher: Arc<dyn Publisher>,
    registry: Registry,
}

impl Session {
    pub fn new(engine: Box<dyn Engine>, publisher: Arc<dyn Publisher>) -> Self {
        Self::with_capabilities(engine, publisher, DEFAULT_CAPABILITIES)
    }

    pub fn with_capabilities(
        engine: Box<dyn Engine>,
        publisher: Arc<dyn Publisher>,
        sets: &[CapabilitySet],
    ) -> Self {
        let registry = Registry::from_sets(sets);
        debug!("Session registered {} operation(s)", registry.len());
        Self {
            engine,
            vars: BTreeMap::new(),
            publisher,
            registry,
        }
    }

    /// Run the operation registered under `name`.
    pub fn dispatch(&mut self, name: &str, args: &CallArgs) -> Result<Reply> {
        let Some(handler) = self.registry.get(name) else {
            warn!("Unknown operation: {}", name);
            return Err(KernelError::UnknownOperation {
                name: name.to_string(),
            });
        };
        debug!("Dispatching {}", name);
        handler(self, args)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> &mut dyn Engine {
        self.engine.as_mut()
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn var_names(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    /// Bind a variable. Returns `false` when the name is taken and
    /// `replace_existing` is off.
    pub fn define_var(&mut self, name: &str, value: Value, replace_existing: bool) -> bool {
        if !replace_existing && self.vars.contains_key(name) {
            return false;
        }
        self.vars.insert(name.to_string(), value);
        true
    }

    /// Bind an engine object under `varname`, or under its own name when blank.
    pub fn define_object_var(
        &mut self,
        obj: &ObjectRef,
        varname: Option<&str>,
        replace_existing: bool,
    ) -> bool {
        let name = varname
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| obj.name())
            .to_string();
        self.define_var(&name, Value::Object(obj.clone()), replace_existing)
    }

    pub fn remove_var(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    /// Model named `model`, or the current one, or a fresh one.
    pub fn get_or_create_model(&mut self, model: Option<&str>) -> Result<ObjectRef> {
        match model {
            Some(name) => self.engine.get_model(name),
            None => match self.engine.current_model() {
                Some(current) => Ok(current),
                None => self.engine.new_model(None),
            },
        }
    }

    /// Publish a kernel message carrying `data` as its payload.
    pub fn send_mx_msg(
        &self,
        msgtype: &str,
        content: Option<Map<String, JsonValue>>,
        data: &Value,
    ) -> Result<()> {
        let mut content = content.unwrap_or_default();
        content.insert(
            ChannelConfig::SUBTYPE_KEY.to_string(),
            JsonValue::from(msgtype),
        );
        let payload = Payload::from_value(data)?;
        self.publisher
            .publish(ChannelConfig::MESSAGE_TYPE, content, payload)
    }

    /// Publish an evaluation result, falling back to an empty message.
    ///
    /// For `analyze_*_setnode` messages the `value` entry is replaced by its
    /// display form first. Failures are logged and never surface.
    pub fn publish_eval_result(&self, msgtype: &str, mut data: Value) {
        if msgtype.starts_with("analyze_") && msgtype.ends_with("_setnode") {
            display_value_entry(&mut data);
        }

        if let Err(e) = self.send_mx_msg(msgtype, None, &data) {
            warn!("Failed to send {}: {}; sending empty result", msgtype, e);
            if let Err(e) = self.send_mx_msg(msgtype, None, &Value::None) {
                warn!("Failed to send empty {}: {}", msgtype, e);
            }
        }
    }
}
