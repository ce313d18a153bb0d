//! Diagnostics - Logging Sink and Fatal Hook
//!
//! The memory layer never prints on its own. Every message goes through an
//! injected [`DiagnosticSink`], and unrecoverable OS failures go through an
//! injected [`FatalHook`] that never returns. Both travel together in the
//! [`Diagnostics`] context handed to every component at construction.
//!
//! Log Levels:
//! - ERROR: Failed OS calls, startup failures
//! - WARN: Fallbacks (discontiguous reservation, regular pages)
//! - INFO: Address space summary
//! - DEBUG: Page pool and backing object events
//! - TRACE: Per-call commit/uncommit/map/unmap

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Log level for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Write-only destination for diagnostics
///
/// Emitting never affects control flow.
pub trait DiagnosticSink: Send + Sync {
    /// Record one formatted message
    fn emit(&self, level: LogLevel, message: &str);

    /// Whether messages at `level` are wanted at all
    fn enabled(&self, _level: LogLevel) -> bool {
        true
    }

    /// Flush buffered output, called before a fatal abort
    fn flush(&self) {}
}

/// Sink forwarding to the `log` facade under the `gc` target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&self, level: LogLevel, message: &str) {
        log::log!(target: "gc", log::Level::from(level), "{}", message);
    }

    fn enabled(&self, level: LogLevel) -> bool {
        log::log_enabled!(target: "gc", log::Level::from(level))
    }

    fn flush(&self) {
        log::logger().flush();
    }
}

/// Memory logger configuration
#[derive(Debug, Clone)]
pub struct MemoryLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Echo records to the console
    pub console: bool,

    /// Echo records as JSON lines
    pub json: bool,

    /// Prefix console lines with timestamps
    pub timestamps: bool,
}

impl Default for MemoryLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Trace,
            console: false,
            json: false,
            timestamps: true,
        }
    }
}

/// One recorded diagnostic
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub at: Instant,
    pub level: LogLevel,
    pub message: String,
}

/// Sink that keeps every record in memory
///
/// Used by tests and tools that want to inspect what the layer reported.
pub struct MemoryLogger {
    config: MemoryLoggerConfig,
    records: Mutex<Vec<LogRecord>>,
    enabled: AtomicBool,
}

impl MemoryLogger {
    /// Create new memory logger
    pub fn new(config: MemoryLoggerConfig) -> Self {
        Self {
            config,
            records: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable recording
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable recording
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if recording is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Snapshot of all records
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Number of records
    pub fn count(&self) -> usize {
        self.records.lock().len()
    }

    /// Clear all records
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Check if any record at `level` contains `needle`
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }

    fn output_console(&self, level: LogLevel, message: &str) {
        if self.config.json {
            let json = serde_json::json!({
                "level": level,
                "message": message,
            });
            if let Ok(line) = serde_json::to_string(&json) {
                println!("{}", line);
            }
            return;
        }

        if self.config.timestamps {
            let now = chrono::Local::now();
            print!("[{}] ", now.format("%Y-%m-%d %H:%M:%S%.3f"));
        }
        println!("[gc] [{:?}] {}", level, message);
    }
}

impl Default for MemoryLogger {
    fn default() -> Self {
        Self::new(MemoryLoggerConfig::default())
    }
}

impl DiagnosticSink for MemoryLogger {
    fn emit(&self, level: LogLevel, message: &str) {
        if !self.is_enabled() || level > self.config.level {
            return;
        }

        self.records.lock().push(LogRecord {
            at: Instant::now(),
            level,
            message: message.to_string(),
        });

        if self.config.console {
            self.output_console(level, message);
        }
    }

    fn enabled(&self, level: LogLevel) -> bool {
        self.is_enabled() && level <= self.config.level
    }
}

/// Fatal abort capability
///
/// Called after the message has been emitted and the sink flushed.
pub type FatalHook = fn(&str) -> !;

/// Default fatal hook: terminate the process
pub fn abort_process(message: &str) -> ! {
    eprintln!("fatal error: {}", message);
    std::process::abort()
}

/// Fatal hook that unwinds instead, for tests
pub fn panic_on_fatal(message: &str) -> ! {
    panic!("fatal error: {}", message)
}

/// Diagnostics context shared by all components
#[derive(Clone)]
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
    fatal: FatalHook,
}

impl Diagnostics {
    /// Create diagnostics from a sink and a fatal hook
    pub fn new(sink: Arc<dyn DiagnosticSink>, fatal: FatalHook) -> Self {
        Self { sink, fatal }
    }

    /// Emit a message if the sink wants its level
    pub fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if self.sink.enabled(level) {
            self.sink.emit(level, &args.to_string());
        }
    }

    /// Report an unrecoverable condition and never return
    pub fn fatal(&self, message: &str) -> ! {
        self.sink.emit(LogLevel::Error, message);
        self.sink.flush();
        (self.fatal)(message)
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Arc::new(LogSink), abort_process)
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics").finish_non_exhaustive()
    }
}

/// Emit a formatted diagnostic at the given level
macro_rules! diag {
    ($diag:expr, $level:ident, $($arg:tt)*) => {
        $diag.log($crate::logging::LogLevel::$level, format_args!($($arg)*))
    };
}

pub(crate) use diag;

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (Arc<MemoryLogger>, Diagnostics) {
        let logger = Arc::new(MemoryLogger::default());
        let diagnostics = Diagnostics::new(logger.clone(), panic_on_fatal);
        (logger, diagnostics)
    }

    #[test]
    fn test_memory_logger_records() {
        let (logger, diagnostics) = recording();

        diag!(diagnostics, Info, "Address Space Size: {}M", 1024);

        assert_eq!(logger.count(), 1);
        assert!(logger.contains(LogLevel::Info, "1024M"));
    }

    #[test]
    fn test_memory_logger_level_filter() {
        let logger = Arc::new(MemoryLogger::new(MemoryLoggerConfig {
            level: LogLevel::Warn,
            ..Default::default()
        }));
        let diagnostics = Diagnostics::new(logger.clone(), panic_on_fatal);

        diag!(diagnostics, Trace, "dropped");
        diag!(diagnostics, Error, "kept");

        assert_eq!(logger.count(), 1);
    }

    #[test]
    fn test_memory_logger_disable() {
        let (logger, diagnostics) = recording();

        logger.disable();
        diag!(diagnostics, Error, "ignored");

        assert_eq!(logger.count(), 0);
    }

    #[test]
    #[should_panic(expected = "fatal error: Failed to unreserve memory")]
    fn test_fatal_hook_invoked() {
        let (_logger, diagnostics) = recording();
        diagnostics.fatal("Failed to unreserve memory");
    }

    #[test]
    fn test_fatal_message_recorded_before_hook() {
        let (logger, diagnostics) = recording();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            diagnostics.fatal("Failed to close handle (5)");
        }));

        assert!(result.is_err());
        assert!(logger.contains(LogLevel::Error, "Failed to close handle (5)"));
    }
}
