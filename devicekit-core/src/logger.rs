//! Forwards the crate's log output to a host-provided sink.
//!
//! Events are emitted with `tracing`, which falls back to `log` records when
//! no `tracing` subscriber is installed. [`set_logger`] installs a `log`
//! backend that hands those records to a [`Logger`].

use std::sync::{Arc, OnceLock};

/// A sink for log messages.
///
/// # Examples
///
/// ```rust
/// use devicekit_core::logger::{LogLevel, Logger};
///
/// struct StderrLogger;
///
/// impl Logger for StderrLogger {
///     fn log(&self, level: LogLevel, message: String) {
///         eprintln!("[{level:?}] {message}");
///     }
/// }
/// ```
pub trait Logger: Sync + Send {
    /// Logs `message` at `level`.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Very detailed messages.
    Trace,
    /// Debugging information.
    Debug,
    /// Progress of provisioning and uploads.
    Info,
    /// Recoverable problems.
    Warn,
    /// Failures.
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Self::Error,
            log::Level::Warn => Self::Warn,
            log::Level::Info => Self::Info,
            log::Level::Debug => Self::Debug,
            log::Level::Trace => Self::Trace,
        }
    }
}

/// `log` backend that forwards to the installed [`Logger`].
struct ForeignLogger;

impl log::Log for ForeignLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !should_forward(record.level(), record.module_path()) {
            return;
        }
        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(record.level().into(), format!("{}", record.args()));
        } else {
            eprintln!("Logger not set: {}", record.args());
        }
    }

    fn flush(&self) {}
}

/// Debug and trace records are only forwarded from this crate; dependencies
/// such as the HTTP stack are too chatty at those levels.
fn should_forward(level: log::Level, module_path: Option<&str>) -> bool {
    let from_devicekit = module_path.is_some_and(|path| path.starts_with("devicekit"));
    let verbose = matches!(level, log::Level::Debug | log::Level::Trace);
    from_devicekit || !verbose
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Installs `logger` as the destination of the crate's log output.
///
/// Only the first call has an effect. Later calls, or a process that already
/// installed another `log` backend, print a notice to stderr.
pub fn set_logger(logger: Arc<dyn Logger>) {
    if LOGGER_INSTANCE.set(logger).is_err() {
        eprintln!("Logger already set");
    }
    if let Err(e) = init_logger() {
        eprintln!("Failed to set logger: {e}");
    }
}

fn init_logger() -> Result<(), log::SetLoggerError> {
    static LOGGER: ForeignLogger = ForeignLogger;
    log::set_logger(&LOGGER)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use test_case::test_case;

    #[test_case(log::Level::Debug, Some("devicekit_core::api"), true ; "own debug")]
    #[test_case(log::Level::Trace, Some("hyper::proto"), false ; "foreign trace")]
    #[test_case(log::Level::Debug, None, false ; "unknown debug")]
    #[test_case(log::Level::Warn, Some("reqwest::connect"), true ; "foreign warn")]
    #[test_case(log::Level::Info, None, true ; "unknown info")]
    fn test_should_forward(level: log::Level, module: Option<&str>, expected: bool) {
        assert_eq!(should_forward(level, module), expected);
    }

    #[derive(Default)]
    struct Capture(Mutex<Vec<(LogLevel, String)>>);

    impl Logger for Capture {
        fn log(&self, level: LogLevel, message: String) {
            self.0.lock().expect("capture").push((level, message));
        }
    }

    #[test]
    fn test_set_logger_forwards_records() {
        let capture = Arc::new(Capture::default());
        set_logger(capture.clone());

        log::warn!(target: "devicekit_core::tests", "lock busy");
        tracing::info!("device renamed");

        let seen = capture.0.lock().expect("capture").clone();
        assert!(seen.contains(&(LogLevel::Warn, "lock busy".to_string())));
        assert!(seen.contains(&(LogLevel::Info, "device renamed".to_string())));
    }
}
