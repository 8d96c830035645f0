use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// Global backend logger instance
static BACKEND_LOGGER: Lazy<Mutex<Option<BackendLogger>>> = Lazy::new(|| Mutex::new(None));

/// Host-installed sink that mirrors every emitted line
static LOG_SINK: Lazy<Mutex<Option<Arc<LogSink>>>> = Lazy::new(|| Mutex::new(None));

/// Lines below this level are dropped (DEBUG is only emitted when enabled)
static MIN_LEVEL: Lazy<Mutex<LogLevel>> = Lazy::new(|| {
    Mutex::new(if cfg!(debug_assertions) {
        LogLevel::Debug
    } else {
        LogLevel::Info
    })
});

/// Callback receiving every log line after filtering.
pub type LogSink = dyn Fn(LogLevel, &str) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// File-backed logger: INFO/DEBUG to the log file, WARN/ERROR to the error file
pub struct BackendLogger {
    log_file_path: PathBuf,
    error_file_path: PathBuf,
}

impl BackendLogger {
    /// Initialize the backend logger with file paths
    pub fn init(log_file_path: PathBuf, error_file_path: PathBuf) -> Result<(), String> {
        let logger = BackendLogger {
            log_file_path,
            error_file_path,
        };

        logger.ensure_files_writable()?;

        *BACKEND_LOGGER.lock() = Some(logger);

        log_info("[logging] Backend logger initialized");

        Ok(())
    }

    fn ensure_files_writable(&self) -> Result<(), String> {
        for path in [&self.log_file_path, &self.error_file_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create log directory: {}", e))?;
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("Cannot write to log file {}: {}", path.display(), e))?;
        }
        Ok(())
    }

    fn write_log(&self, level: LogLevel, message: &str) {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let log_entry = format!("[{}] [{}] {}\n", timestamp, level.as_str(), message);

        let file_path = match level {
            LogLevel::Error | LogLevel::Warn => &self.error_file_path,
            _ => &self.log_file_path,
        };

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(file_path) {
            let _ = file.write_all(log_entry.as_bytes());
            let _ = file.flush();
        }
    }
}

/// Install (or remove) the host log sink
pub fn set_log_sink(sink: Option<Arc<LogSink>>) {
    *LOG_SINK.lock() = sink;
}

pub fn set_min_level(level: LogLevel) {
    *MIN_LEVEL.lock() = level;
}

pub fn log(level: LogLevel, message: &str) {
    if level < *MIN_LEVEL.lock() {
        return;
    }

    match level {
        LogLevel::Warn | LogLevel::Error => eprintln!("[{}] {}", level.as_str(), message),
        _ => println!("[{}] {}", level.as_str(), message),
    }

    if let Some(logger) = BACKEND_LOGGER.lock().as_ref() {
        logger.write_log(level, message);
    }

    // Clone out so a sink that logs again cannot deadlock on the slot
    let sink = LOG_SINK.lock().clone();
    if let Some(sink) = sink {
        sink(level, message);
    }
}

pub fn log_info(message: &str) {
    log(LogLevel::Info, message);
}

pub fn log_warn(message: &str) {
    log(LogLevel::Warn, message);
}

pub fn log_error(message: &str) {
    log(LogLevel::Error, message);
}

pub fn log_debug(message: &str) {
    log(LogLevel::Debug, message);
}

/// Convenience macro for logging with format arguments
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!(LogLevel::Warn.as_str(), "WARN");
    }
}
