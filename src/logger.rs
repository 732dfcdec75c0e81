//! Pluggable logging sink for engine-level warnings and errors
//!
//! Subscriber panics and advisory warnings (such as exceeding the soft
//! cache size) are reported through a [`QueryLogger`]. The default
//! [`TracingLogger`] forwards them to `tracing`.

use serde_json::Value;
use std::fmt;
use tracing::{error, warn};

/// Sink for warnings and errors raised inside the engine
pub trait QueryLogger: Send + Sync + fmt::Debug {
    /// Report a recoverable condition
    fn warn(&self, message: &str, meta: &Value);

    /// Report a failure that was caught and swallowed
    fn error(&self, message: &str, meta: &Value);
}

/// Logger that emits through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl QueryLogger for TracingLogger {
    fn warn(&self, message: &str, meta: &Value) {
        warn!(meta = %meta, "{}", message);
    }

    fn error(&self, message: &str, meta: &Value) {
        error!(meta = %meta, "{}", message);
    }
}
