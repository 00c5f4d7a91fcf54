//! Centralized configuration for the kernel.
//!
//! Constants for evaluation limits, display rendering, persistence layout and
//! the notification channel.

/// Kernel-level configuration.
pub struct KernelConfig;

impl KernelConfig {
    pub const KERNEL_NAME: &'static str = "mxkernel";
    /// Deepest chain of nested cell calls a single evaluation may build.
    pub const MAX_EVAL_DEPTH: usize = 200;
    /// Deepest nesting accepted in expressions, literals and decoded payloads.
    pub const MAX_PARSE_DEPTH: usize = 100;
    /// Largest opaque payload accepted from a front end, in bytes.
    pub const MAX_PAYLOAD_BYTES: u64 = 16 * 1024 * 1024;
    /// Prefix used when the engine picks a model name.
    pub const AUTO_MODEL_PREFIX: &'static str = "Model";
    /// Prefix used when the engine picks a space name.
    pub const AUTO_SPACE_PREFIX: &'static str = "Space";
    /// Prefix used when the engine picks a cells name.
    pub const AUTO_CELLS_PREFIX: &'static str = "Cells";
    /// Formula bound to cells created without one.
    pub const DEFAULT_FORMULA: &'static str = "lambda: None";
}

/// Value display rendering.
pub struct DisplayConfig;

impl DisplayConfig {
    pub const TYPE_PREFIX: &'static str = "Type: ";
}

/// Model persistence layout.
pub struct PersistConfig;

impl PersistConfig {
    pub const MODEL_FILE_NAME: &'static str = "model.json";
    pub const FORMAT_VERSION: u32 = 1;
    pub const BACKUP_SUFFIX: &'static str = "_BAK";
    /// Upper bound on numbered backups probed before giving up.
    pub const MAX_BACKUPS: u32 = 1000;
}

/// Notification channel configuration.
pub struct ChannelConfig;

impl ChannelConfig {
    /// Message type of every notification published by the kernel.
    pub const MESSAGE_TYPE: &'static str = "modelx_msg";
    /// Content key carrying the kernel-specific message subtype.
    pub const SUBTYPE_KEY: &'static str = "mx_msgtype";
    /// Buffered notifications kept for slow subscribers.
    pub const BROADCAST_CAPACITY: usize = 256;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_are_reasonable() {
        assert!(KernelConfig::MAX_EVAL_DEPTH > 100);
        assert!(KernelConfig::MAX_PARSE_DEPTH >= 32);
        assert!(ChannelConfig::BROADCAST_CAPACITY > 0);
        assert!(PersistConfig::MAX_BACKUPS > 0);
    }

    #[test]
    fn test_default_formula_is_a_stub() {
        assert!(KernelConfig::DEFAULT_FORMULA.starts_with("lambda"));
    }
}
