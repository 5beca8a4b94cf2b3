//! Structured logging and tracing for Helia
//!
//! Console/file output goes through the tracing ecosystem; in parallel every
//! component logger feeds the in-process journal ring buffer that the web UI
//! reads via `/api/logs`.

use crate::config::LoggingSettings;
use crate::error::{HeliaError, Result};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Once;
use tracing::{Level, debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub mod journal;

pub use journal::{Journal, JournalLevel, LogCategory, LogEntry};

// Keep the non-blocking worker guard alive for the entire process lifetime
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT_ONCE: Once = Once::new();
static INIT_ERROR: OnceCell<String> = OnceCell::new();

/// Initialize logging system based on configuration
pub fn init_logging(config: &LoggingSettings) -> Result<()> {
    INIT_ONCE.call_once(|| {
        let init_result = (|| -> Result<()> {
            let base_level = parse_log_level(&config.level)?;
            let filter = build_env_filter(base_level);

            if should_use_console_only() {
                init_console_only_logging(filter, config.json_format, base_level);
                return Ok(());
            }

            init_file_logging(config, filter, base_level)?;
            Ok(())
        })();

        if let Err(e) = init_result {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });

    if let Some(err) = INIT_ERROR.get() {
        return Err(HeliaError::config(err.clone()));
    }
    Ok(())
}

fn build_env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("helia={},tokio_modbus=warn", level).into())
}

fn should_use_console_only() -> bool {
    cfg!(test) || std::env::var_os("HELIA_DISABLE_FILE_LOG").is_some()
}

fn init_console_only_logging(filter: EnvFilter, json_format: bool, console_level: Level) {
    let console_layer = {
        let layer = fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false);
        if json_format {
            layer
                .json()
                .with_filter(LevelFilter::from_level(console_level))
                .boxed()
        } else {
            layer
                .with_filter(LevelFilter::from_level(console_level))
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .init();

    info!("Logging initialized - level: {:?}, console-only", console_level);
}

fn init_file_logging(config: &LoggingSettings, filter: EnvFilter, level: Level) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter);

    // Set up log file appender with rotation
    let file_appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("helia")
        .filename_suffix("log")
        .max_log_files(config.backup_count as usize)
        .build({
            // If config.file is a file path, use its parent dir; otherwise treat as dir
            let p = Path::new(&config.file);
            if p.extension().is_some() {
                p.parent().unwrap_or(p)
            } else {
                p
            }
        })
        .map_err(|e| HeliaError::io(format!("Failed to create log file appender: {}", e)))?;

    let (non_blocking_appender, guard) = non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let file_layer = {
        let base = fmt::layer()
            .with_writer(non_blocking_appender)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false);
        if config.json_format {
            base.json()
                .with_filter(LevelFilter::from_level(level))
                .boxed()
        } else {
            base.with_filter(LevelFilter::from_level(level)).boxed()
        }
    };

    let subscriber = registry.with(file_layer);

    if config.console_output {
        let console_layer = {
            let base = fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false);
            if config.json_format {
                base.json()
                    .with_filter(LevelFilter::from_level(level))
                    .boxed()
            } else {
                base.with_filter(LevelFilter::from_level(level)).boxed()
            }
        };
        subscriber.with(console_layer).init();
    } else {
        subscriber.init();
    }

    info!(
        "Logging initialized - level: {:?}, file: {}",
        level, config.file
    );
    Ok(())
}

/// Parse log level string to tracing Level
pub fn parse_log_level(level_str: &str) -> Result<Level> {
    match level_str.to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" | "WARNING" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(HeliaError::config(format!(
            "Invalid log level: {}",
            level_str
        ))),
    }
}

/// Structured logger bound to a journal category
///
/// Messages go to tracing for console/file output and to the journal ring
/// buffer for the web UI.
#[derive(Clone)]
pub struct StructuredLogger {
    category: LogCategory,
}

impl StructuredLogger {
    /// Create a new structured logger for a category
    pub fn new(category: LogCategory) -> Self {
        Self { category }
    }

    pub fn info(&self, message: &str) {
        info!(category = self.category.as_str(), "{}", message);
        journal::record(JournalLevel::Info, self.category, message, None);
    }

    pub fn warn(&self, message: &str) {
        warn!(category = self.category.as_str(), "{}", message);
        journal::record(JournalLevel::Warning, self.category, message, None);
    }

    pub fn error(&self, message: &str) {
        error!(category = self.category.as_str(), "{}", message);
        journal::record(JournalLevel::Error, self.category, message, None);
    }

    pub fn debug(&self, message: &str) {
        debug!(category = self.category.as_str(), "{}", message);
        journal::record(JournalLevel::Debug, self.category, message, None);
    }

    pub fn trace(&self, message: &str) {
        trace!(category = self.category.as_str(), "{}", message);
        journal::record(JournalLevel::Trace, self.category, message, None);
    }

    /// Log with a structured details payload attached to the journal entry
    pub fn error_with_details(&self, message: &str, details: serde_json::Value) {
        error!(category = self.category.as_str(), details = %details, "{}", message);
        journal::record(JournalLevel::Error, self.category, message, Some(details));
    }

    pub fn info_with_details(&self, message: &str, details: serde_json::Value) {
        info!(category = self.category.as_str(), details = %details, "{}", message);
        journal::record(JournalLevel::Info, self.category, message, Some(details));
    }
}

/// Create a logger for a specific component category
pub fn get_logger(category: LogCategory) -> StructuredLogger {
    StructuredLogger::new(category)
}
