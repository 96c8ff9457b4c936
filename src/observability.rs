//! Shared logging configuration and initialization.

use std::env;
use std::fs::{self, OpenOptions};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::parse_bool;

pub const LOG_FILE_NAME: &str = "main.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    /// Console output instead of the log file.
    pub verbose: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
            verbose: false,
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    /// Where events are appended, or `None` when they go to the console.
    pub fn log_file(&self) -> Option<PathBuf> {
        if self.verbose {
            return None;
        }
        self.log_dir.as_ref().map(|dir| dir.join(LOG_FILE_NAME))
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("DATAPULL_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("DATAPULL_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("DATAPULL_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    if let Ok(verbose) = env::var("DATAPULL_VERBOSE") {
        if let Some(parsed) = parse_bool(&verbose) {
            config.verbose = parsed;
        }
    }

    if let Ok(dir) = env::var("DATAPULL_LOG_DIR") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            config.log_dir = Some(PathBuf::from(trimmed));
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, ansi) = match config.log_file() {
        Some(path) => (BoxMakeWriter::new(Mutex::new(open_log_file(&path)?)), false),
        None => (
            BoxMakeWriter::new(io::stderr),
            matches!(config.format, LogFormat::Pretty),
        ),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(ansi)
        .with_writer(writer);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

fn open_log_file(path: &Path) -> Result<fs::File, LoggingInitError> {
    let to_err = |source| LoggingInitError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(to_err)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(to_err)
}

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    let log_file = config
        .log_file()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "console".to_string());
    info!(
        component,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target,
        log_sink = %log_file
    );
}

pub fn log_app_bind(component: &'static str, bound_addr: SocketAddr) {
    info!(
        component,
        event = "app.bind",
        bind_addr = %bound_addr,
        route = "/datasets"
    );
}

pub fn log_recovery(recovered: &[String]) {
    if recovered.is_empty() {
        info!(
            component = "pipeline",
            event = "pipeline.recovery.clean"
        );
    } else {
        warn!(
            component = "pipeline",
            event = "pipeline.recovery.orphans_failed",
            count = recovered.len(),
            datasets = %recovered.join(",")
        );
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}
