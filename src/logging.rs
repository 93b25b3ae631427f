//! Host-facing logging.
//!
//! Internal diagnostics always go through `tracing`. The host application
//! additionally gets a human-readable trace of the connection lifecycle
//! through an injected [`Logger`], written only while debug output is on
//! (builder flag or the shared `logging-enabled` flag).

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::storage::SharedConfig;

// ============================================================================
// LogLevel
// ============================================================================

/// Severity of a host log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Verbose lifecycle detail.
    Debug,
    /// Notable event.
    Info,
    /// Recoverable problem.
    Warn,
    /// Failure.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Logger
// ============================================================================

/// Sink for host log lines.
pub trait Logger: Send + Sync {
    /// Writes one line.
    fn log(&self, level: LogLevel, message: &str);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Forwards host log lines to `tracing` under the `push_client::host` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "push_client::host", "{message}"),
            LogLevel::Info => info!(target: "push_client::host", "{message}"),
            LogLevel::Warn => warn!(target: "push_client::host", "{message}"),
            LogLevel::Error => error!(target: "push_client::host", "{message}"),
        }
    }
}

// ============================================================================
// HostLog
// ============================================================================

/// Gate in front of the injected logger.
#[derive(Clone)]
pub(crate) struct HostLog {
    logger: Arc<dyn Logger>,
    debug: bool,
    shared: SharedConfig,
}

impl HostLog {
    pub(crate) fn new(logger: Arc<dyn Logger>, debug: bool, shared: SharedConfig) -> Self {
        Self {
            logger,
            debug,
            shared,
        }
    }

    /// Returns `true` if lines are currently written.
    pub(crate) fn enabled(&self) -> bool {
        self.debug || self.shared.is_logging_enabled()
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        if self.enabled() {
            self.logger.log(level, message.as_ref());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    use crate::storage::MemoryStore;

    #[derive(Default)]
    struct RecordingLogger {
        lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl Logger for RecordingLogger {
        fn log(&self, level: LogLevel, message: &str) {
            self.lines.lock().push((level, message.to_string()));
        }
    }

    #[test]
    fn test_gate_follows_shared_flag() {
        let recorder = Arc::new(RecordingLogger::default());
        let shared = SharedConfig::new(Arc::new(MemoryStore::new()), 1, "s1");
        let log = HostLog::new(Arc::clone(&recorder) as Arc<dyn Logger>, false, shared.clone());

        log.log(LogLevel::Info, "hidden");
        assert!(recorder.lines.lock().is_empty());

        shared.set_logging_enabled(true);
        log.log(LogLevel::Warn, "shown");
        assert_eq!(
            recorder.lines.lock().as_slice(),
            &[(LogLevel::Warn, "shown".to_string())]
        );
    }

    #[test]
    fn test_debug_flag_forces_output() {
        let recorder = Arc::new(RecordingLogger::default());
        let shared = SharedConfig::new(Arc::new(MemoryStore::new()), 1, "s1");
        let log = HostLog::new(Arc::clone(&recorder) as Arc<dyn Logger>, true, shared);

        assert!(log.enabled());
        log.log(LogLevel::Debug, "line");
        assert_eq!(recorder.lines.lock().len(), 1);
    }

    #[test]
    fn test_builtin_loggers_accept_lines() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("trace")
            .with_test_writer()
            .try_init();
        NoopLogger.log(LogLevel::Error, "dropped");
        TracingLogger.log(LogLevel::Info, "forwarded");
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }
}
