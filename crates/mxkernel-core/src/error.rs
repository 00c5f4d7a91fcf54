//! Error types for the model kernel.
//!
//! Every failure a dispatched operation can report is a variant of
//! [`KernelError`]. Variants map onto JSON-RPC error codes so the host can
//! forward them to the front end without inspecting messages.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    // Dispatch errors
    #[error("Unknown operation: {name}")]
    UnknownOperation { name: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    // Engine graph errors
    #[error("Name not found: {name}")]
    Resolution { name: String },

    #[error("Value for {target} not found")]
    ValueNotReady { target: String },

    #[error("Formula error: {message}")]
    Formula { message: String },

    #[error("Evaluation error in {node}: {message}")]
    Evaluation { node: String, message: String },

    #[error("Engine error: {message}")]
    Engine { message: String },

    // Codec errors
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Channel errors
    #[error("Notification could not be sent: {message}")]
    Notification { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Archive error at {path:?}: {message}")]
    Archive { message: String, path: PathBuf },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for kernel operations.
pub type Result<T> = std::result::Result<T, KernelError>;

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        KernelError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<bincode::Error> for KernelError {
    fn from(err: bincode::Error) -> Self {
        KernelError::Serialization {
            message: err.to_string(),
        }
    }
}

impl KernelError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        KernelError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for a resolution failure on `name`.
    pub fn not_found(name: impl Into<String>) -> Self {
        KernelError::Resolution { name: name.into() }
    }

    /// Shorthand for an engine-level failure.
    pub fn engine(message: impl Into<String>) -> Self {
        KernelError::Engine {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32001: Name not found in the engine graph
    /// - -32002: Value not computed and calculation not requested
    /// - -32003: Formula could not be parsed
    /// - -32004: Formula evaluation failed
    /// - -32005: Value could not be serialized
    /// - -32006: Engine rejected the operation
    /// - -32007: Persistence (IO or archive) failure
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            KernelError::Parse { .. } | KernelError::Json { .. } => -32700,

            KernelError::UnknownOperation { .. } => -32601,

            KernelError::InvalidParams { .. } => -32602,

            KernelError::Resolution { .. } => -32001,

            KernelError::ValueNotReady { .. } => -32002,

            KernelError::Formula { .. } => -32003,

            KernelError::Evaluation { .. } => -32004,

            KernelError::Serialization { .. } => -32005,

            KernelError::Engine { .. } => -32006,

            KernelError::Io { .. } | KernelError::Archive { .. } => -32007,

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// Check if the caller may retry the same call with `calc` enabled.
    pub fn needs_computation(&self) -> bool {
        matches!(self, KernelError::ValueNotReady { .. })
    }
}
