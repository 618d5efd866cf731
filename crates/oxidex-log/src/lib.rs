//! Leveled logging for the `OxideX` workspace.
//!
//! Records are filtered by a global level and handed to a [`Sink`]. The
//! default sink writes colored lines to stderr so that log output never mixes
//! with data a program writes to stdout. Tests install a [`MemorySink`] to
//! assert on what a component logged.
//!
//! # Example
//!
//! ```
//! use oxidex_log::{debug, info, warn, Level};
//!
//! oxidex_log::set_level(Level::Debug);
//!
//! let peer = "127.0.0.1:7000";
//! info!("connected to {}", peer);
//! debug!("sequence window: {:?}", 0..4);
//! warn!("reply arrived after timeout");
//! ```
//!
//! The level can also be taken from the environment:
//!
//! ```
//! // OXIDEX_LOG=trace ./server
//! oxidex_log::init_from_env();
//! ```

use std::fmt::Arguments;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Environment variable read by [`init_from_env`].
pub const LOG_ENV: &str = "OXIDEX_LOG";

/// Severity of a log record. Lower values are more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Failures that end an operation or a connection.
    Error = 0,
    /// Recoverable anomalies.
    Warn = 1,
    /// Lifecycle events.
    Info = 2,
    /// Per-message diagnostics.
    Debug = 3,
    /// Wire-level detail.
    Trace = 4,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case name of this level.
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Level {
        match raw {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    /// Parses a level name, ignoring case.
    ///
    /// ```
    /// use oxidex_log::Level;
    ///
    /// assert_eq!("warn".parse::<Level>(), Ok(Level::Warn));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            _ => Err(format!("invalid log level: {s}")),
        }
    }
}

/// A formatted log record as seen by a [`Sink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Severity.
    pub level: Level,
    /// Module path of the call site.
    pub target: String,
    /// Rendered message.
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u128,
}

/// Destination for log records.
pub trait Sink: Send + Sync {
    /// Consumes one record that passed the level filter.
    fn write(&self, record: &Record);
}

/// Writes colored records to stderr.
pub struct StderrSink;

impl Sink for StderrSink {
    fn write(&self, record: &Record) {
        static RESET: &str = "\x1b[0m";
        let color = record.level.color_code();
        let mut err = std::io::stderr().lock();
        // A failed write to stderr has nowhere better to go.
        let _ = writeln!(
            err,
            "{color}[{}]{RESET} {} {}: {}",
            record.level.as_str(),
            record.timestamp_ms,
            record.target,
            record.message
        );
    }
}

/// Collects records in memory.
///
/// ```
/// use oxidex_log::{MemorySink, Level};
/// use std::sync::Arc;
///
/// let sink = Arc::new(MemorySink::default());
/// oxidex_log::set_sink(sink.clone());
/// oxidex_log::set_level(Level::Info);
/// oxidex_log::info!("hello");
/// assert!(sink.contains("hello"));
/// ```
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    /// Returns a copy of everything collected so far.
    pub fn records(&self) -> Vec<Record> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether any collected message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.records().iter().any(|r| r.message.contains(needle))
    }
}

impl Sink for MemorySink {
    fn write(&self, record: &Record) {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
    }
}

/// The global logger: a level filter plus a sink.
pub struct Logger {
    level: AtomicU8,
    sink: RwLock<Arc<dyn Sink>>,
}

impl Logger {
    fn new(level: Level) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            sink: RwLock::new(Arc::new(StderrSink)),
        }
    }

    /// Sets the most verbose level that is still emitted.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Returns the current level.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Checks if a record at `level` would be emitted.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }

    /// Replaces the sink.
    pub fn set_sink(&self, sink: Arc<dyn Sink>) {
        match self.sink.write() {
            Ok(mut current) => *current = sink,
            Err(poisoned) => *poisoned.into_inner() = sink,
        }
    }

    fn sink(&self) -> Arc<dyn Sink> {
        match self.sink.read() {
            Ok(sink) => Arc::clone(&sink),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, creating it at `Level::Warn` on first use.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(Level::Warn))
}

/// Sets the global level.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the global level from a level name.
pub fn set_level_from_str(s: &str) -> Result<(), String> {
    set_level(s.parse()?);
    Ok(())
}

/// Replaces the global sink.
pub fn set_sink(sink: Arc<dyn Sink>) {
    get_logger().set_sink(sink);
}

/// Reads [`LOG_ENV`] and applies it if it names a valid level.
///
/// Returns the level now in effect.
pub fn init_from_env() -> Level {
    if let Ok(value) = std::env::var(LOG_ENV) {
        if let Ok(level) = value.parse::<Level>() {
            set_level(level);
        }
    }
    get_logger().level()
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments) {
    let logger = get_logger();
    if !logger.enabled(level) {
        return;
    }

    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);

    let record = Record {
        level,
        target: target.to_owned(),
        message: args.to_string(),
        timestamp_ms,
    };
    logger.sink().write(&record);
}

/// Logs at an explicit level, tagging the record with the caller's module.
///
/// ```
/// use oxidex_log::{log, Level};
///
/// log!(level: Level::Info, "port {} registered", 7000);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            if $crate::get_logger().enabled($level) {
                $crate::__log_with_target(
                    $level,
                    module_path!(),
                    format_args!($($arg)*)
                );
            }
        }
    };
}

/// Whether a record at the given level would be emitted.
#[macro_export]
macro_rules! log_enabled {
    ($level:expr) => {
        $crate::get_logger().enabled($level)
    };
}

/// Logs at [`Level::Error`].
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs at [`Level::Warn`].
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs at [`Level::Info`].
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs at [`Level::Debug`].
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs at [`Level::Trace`].
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("error".parse::<Level>(), Ok(Level::Error));
        assert_eq!("WARNING".parse::<Level>(), Ok(Level::Warn));
        assert_eq!(" Info ".parse::<Level>(), Ok(Level::Info));
        assert_eq!("trace".parse::<Level>(), Ok(Level::Trace));
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn test_logger_level_filtering() {
        let logger = Logger::new(Level::Info);

        assert!(logger.enabled(Level::Error));
        assert!(logger.enabled(Level::Info));
        assert!(!logger.enabled(Level::Debug));

        logger.set_level(Level::Trace);
        assert!(logger.enabled(Level::Trace));
        assert_eq!(logger.level(), Level::Trace);
    }

    #[test]
    fn test_private_sink_receives_records() {
        let logger = Logger::new(Level::Debug);
        let sink = Arc::new(MemorySink::default());
        logger.set_sink(sink.clone());

        logger.sink().write(&Record {
            level: Level::Debug,
            target: "oxidex_log::tests".into(),
            message: "frame 3 decoded".into(),
            timestamp_ms: 0,
        });

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, Level::Debug);
        assert!(sink.contains("frame 3"));
    }

    #[test]
    fn test_set_level_from_str_rejects_garbage() {
        assert!(set_level_from_str("nope").is_err());
    }
}
