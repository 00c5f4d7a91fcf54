//! mxkernel - Message-dispatch adapter between a model engine and a console
//! front end.
//!
//! A [`Session`] binds named operations to handlers, runs them against an
//! [`Engine`] and returns replies as JSON or opaque value payloads. Values
//! cross the wire through the tuple-preserving JSON codec, the display codec
//! and bincode payloads.
//!
//! # Example
//!
//! ```rust,ignore
//! use mxkernel::{BroadcastPublisher, CallArgs, InMemoryEngine, Session};
//! use std::sync::Arc;
//!
//! let publisher = Arc::new(BroadcastPublisher::new(16));
//! let mut session = Session::new(Box::new(InMemoryEngine::new()), publisher);
//!
//! session.dispatch("mx_new_model", &CallArgs::new().with("name", "Model1"))?;
//! let list = session.dispatch("mx_get_modellist", &CallArgs::new())?;
//! ```

pub mod codec;
pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod notify;
pub mod session;
pub mod value;

// Re-export commonly used types
pub use codec::Payload;
pub use config::{ChannelConfig, DisplayConfig, KernelConfig, PersistConfig};
pub use display::to_display_value;
pub use engine::{Adjacency, Engine, InMemoryEngine, Lookup, NodeRef};
pub use error::{KernelError, Result};
pub use notify::{BroadcastPublisher, Notification, Publisher};
pub use session::{CallArgs, CapabilitySet, Handler, Reply, Session};
pub use value::{ForeignValue, ObjectKind, ObjectRef, Scalar, Value};
