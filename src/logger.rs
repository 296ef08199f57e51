use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

pub const LOG_FILE_PREFIX: &str = "appmanager.log";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    /// An `EnvFilter` directive, e.g. `info` or `appmanager=debug`.
    pub level: String,
    /// When set, logs are also written to a daily rolling file in there.
    pub dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(level: impl Into<String>, dir: Option<PathBuf>) -> Self {
        Self {
            level: level.into(),
            dir,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info", None)
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for as long as the process logs.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log level `{}`", config.level))?;

    let stdout_layer = fmt::layer().with_target(true).with_thread_names(true);

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    info!(level = %config.level, dir = ?config.dir, "logging initialised");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_level_is_rejected() {
        let config = LogConfig::new("appmanager=chatty", None);
        assert!(init_tracing(&config).is_err());
    }

    #[test]
    fn default_logs_info_to_stdout_only() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.dir.is_none());
    }
}
