//! Injected logging collaborator.
//!
//! Components never log through process-wide state. Each one is handed an
//! `Arc<dyn Logger>` at construction time and logs through it.
//!
//! # Implementations
//!
//! - [`TracingLogger`] forwards to the `tracing` macros (the default)
//! - [`NullLogger`] discards everything
//! - [`MemoryLogger`] keeps formatted lines in memory, for tests
//!
//! # Example
//!
//! ```
//! use kestrel_platform::logging::{Level, Logger, MemoryLogger};
//!
//! let logger = MemoryLogger::new();
//! logger.info(format_args!("negotiated {}", "aes128-ctr"));
//!
//! assert!(logger.contains("negotiated aes128-ctr"));
//! assert_eq!(logger.records()[0].0, Level::Info);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

/// Log severity, most verbose first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Wire-level detail
    Trace,
    /// Per-packet and per-channel events
    Debug,
    /// Handshake milestones
    Info,
    /// Unusual but tolerated peer behaviour
    Warn,
    /// Failures
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Leveled logging sink passed to every component that logs.
pub trait Logger: Send + Sync {
    /// Records one message.
    fn log(&self, level: Level, args: fmt::Arguments<'_>);

    /// Returns `false` if messages at `level` would be discarded.
    fn enabled(&self, _level: Level) -> bool {
        true
    }

    /// Logs at [`Level::Trace`].
    fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args)
    }

    /// Logs at [`Level::Debug`].
    fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }

    /// Logs at [`Level::Info`].
    fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }

    /// Logs at [`Level::Warn`].
    fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }

    /// Logs at [`Level::Error`].
    fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }
}

/// Forwards to the `tracing` macros under the `kestrel` target.
///
/// Every event carries a `component` field naming the logger's owner, so
/// several clients in one process can be told apart:
///
/// ```text
/// INFO kestrel: authenticated as deploy component="db-tunnel"
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    component: &'static str,
}

impl TracingLogger {
    /// Creates a logger tagging events with `component`.
    pub const fn new(component: &'static str) -> Self {
        Self { component }
    }

    /// The `component` field value.
    pub fn component(&self) -> &'static str {
        self.component
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new("ssh")
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let component = self.component;
        match level {
            Level::Trace => tracing::trace!(target: "kestrel", component, "{}", args),
            Level::Debug => tracing::debug!(target: "kestrel", component, "{}", args),
            Level::Info => tracing::info!(target: "kestrel", component, "{}", args),
            Level::Warn => tracing::warn!(target: "kestrel", component, "{}", args),
            Level::Error => tracing::error!(target: "kestrel", component, "{}", args),
        }
    }

    fn enabled(&self, level: Level) -> bool {
        match level {
            Level::Trace => tracing::enabled!(target: "kestrel", tracing::Level::TRACE),
            Level::Debug => tracing::enabled!(target: "kestrel", tracing::Level::DEBUG),
            Level::Info => tracing::enabled!(target: "kestrel", tracing::Level::INFO),
            Level::Warn => tracing::enabled!(target: "kestrel", tracing::Level::WARN),
            Level::Error => tracing::enabled!(target: "kestrel", tracing::Level::ERROR),
        }
    }
}

/// Discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: Level, _args: fmt::Arguments<'_>) {}

    fn enabled(&self, _level: Level) -> bool {
        false
    }
}

/// Keeps every formatted message in memory.
///
/// Clones share the same buffer, so a test can keep one clone and hand
/// another to the component under test.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogger {
    records: Arc<Mutex<Vec<(Level, String)>>>,
}

impl MemoryLogger {
    /// Creates an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded messages.
    pub fn records(&self) -> Vec<(Level, String)> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns `true` if any recorded message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.records().iter().any(|(_, line)| line.contains(needle))
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let line = args.to_string();
        match self.records.lock() {
            Ok(mut guard) => guard.push((level, line)),
            Err(poisoned) => poisoned.into_inner().push((level, line)),
        }
    }
}

/// Returns the default logger.
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_memory_logger_records_levels() {
        let logger = MemoryLogger::new();
        logger.debug(format_args!("channel {} opened", 0));
        logger.warn(format_args!("ignoring message {}", 2));

        let records = logger.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (Level::Debug, "channel 0 opened".to_string()));
        assert_eq!(records[1].0, Level::Warn);
    }

    #[test]
    fn test_memory_logger_clones_share_buffer() {
        let logger = MemoryLogger::new();
        let shared: Arc<dyn Logger> = Arc::new(logger.clone());
        shared.info(format_args!("hello"));
        assert!(logger.contains("hello"));
    }

    #[test]
    fn test_null_logger_disabled() {
        let logger = NullLogger;
        assert!(!logger.enabled(Level::Error));
        logger.error(format_args!("dropped"));
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tracing_logger_forwards_with_component() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let logger = TracingLogger::new("db-tunnel");
            assert!(logger.enabled(Level::Debug));
            logger.debug(format_args!("forwarded {}", 7));
        });

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("DEBUG"));
        assert!(output.contains("kestrel"));
        assert!(output.contains("forwarded 7"));
        assert!(output.contains("component=\"db-tunnel\""));
    }

    #[test]
    fn test_default_tracing_component() {
        assert_eq!(TracingLogger::default().component(), "ssh");
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error > Level::Warn);
        assert!(Level::Warn > Level::Info);
        assert!(Level::Trace < Level::Debug);
        assert_eq!(Level::Info.to_string(), "INFO");
    }
}
