use serde::{Deserialize, Serialize};
use std::{fs::File, sync::Arc};
use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Plain,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    File,
}

/// Logging configuration, usually embedded as the `[log]` table of the
/// connector configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogConfig {
    /// A level (`info`) or a full filter directive
    /// (`info,clearing_house_connector=debug`).
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Path to the log file, required if output is "file".
    pub file_path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
            output: LogOutput::Stdout,
            file_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Log output is 'file' but 'file_path' is not specified")]
    MissingFilePath,

    #[error("Failed to open log file '{path}': {source}")]
    OpenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("A global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Builds the level filter. An unparsable directive falls back to `info`
/// rather than silencing the process.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber described by `config`.
///
/// Unlike [`init`], this never panics and reports a second installation as
/// [`LoggerError::AlreadyInitialized`].
pub fn try_init(config: &LogConfig) -> Result<(), LoggerError> {
    let subscriber = Registry::default().with(build_filter(&config.level));

    let installed = match config.output {
        LogOutput::File => {
            let file_path = config
                .file_path
                .as_deref()
                .ok_or(LoggerError::MissingFilePath)?;
            let log_file = File::create(file_path).map_err(|source| LoggerError::OpenFile {
                path: file_path.to_string(),
                source,
            })?;
            let file_writer = Arc::new(log_file);

            match config.format {
                LogFormat::Json => subscriber
                    .with(fmt::layer().with_writer(file_writer).json())
                    .try_init(),
                LogFormat::Plain => subscriber
                    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
                    .try_init(),
            }
        }
        LogOutput::Stdout => match config.format {
            LogFormat::Json => subscriber
                .with(fmt::layer().with_writer(std::io::stdout).json())
                .try_init(),
            LogFormat::Plain => subscriber
                .with(fmt::layer().with_writer(std::io::stdout).pretty())
                .try_init(),
        },
    };

    installed.map_err(|_| LoggerError::AlreadyInitialized)
}

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    try_init(config)?;
    tracing::debug!(level = %config.level, "Logging initialised");
    Ok(())
}
