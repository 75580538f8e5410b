//! Process-wide logging setup.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter`, a console
//! layer and an optional daily-rolling file layer. `RUST_LOG` takes
//! precedence over the configured level when set.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Write to stderr instead of stdout.
    pub stderr: bool,
    /// Directory for a daily-rolling log file, in addition to the console.
    pub file_dir: Option<PathBuf>,
}

impl LogConfig {
    /// Start from `default_level`, honoring `PROGRESS_LOG_FORMAT=json`.
    pub fn from_env(default_level: &str) -> Self {
        let format = match std::env::var("PROGRESS_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        Self {
            level: default_level.to_string(),
            format,
            stderr: false,
            file_dir: None,
        }
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_file_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file_dir = Some(dir.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Guards that flush buffered log output when dropped.
///
/// Hold this for the lifetime of the process.
#[must_use]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingGuards> {
    let (file_writer, file_guard) = match &config.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "progressd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let file_layer = file_writer.map(|writer| fmt::layer().with_ansi(false).with_writer(writer));
    let registry = tracing_subscriber::registry()
        .with(config.filter())
        .with(file_layer);

    match (config.format, config.stderr) {
        (LogFormat::Json, true) => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
        (LogFormat::Json, false) => registry.with(fmt::layer().json()).try_init()?,
        (LogFormat::Pretty, true) => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
        (LogFormat::Pretty, false) => registry.with(fmt::layer()).try_init()?,
    }

    Ok(LoggingGuards { _file: file_guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_level_and_target() {
        let config = LogConfig::from_env("info")
            .with_level("debug")
            .with_stderr()
            .with_format(LogFormat::Json)
            .with_file_dir("/tmp/progress-logs");
        assert_eq!(config.level, "debug");
        assert!(config.stderr);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file_dir, Some(PathBuf::from("/tmp/progress-logs")));
    }
}
