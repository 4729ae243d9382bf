//! Tracing subscriber setup for the CLI.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LecternConfig;

/// Secondary filter variable, consulted when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "LECTERN_LOG";
const LOG_FILE_PREFIX: &str = "lectern.log";

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
    /// Directory for the daily-rotated file log, if enabled.
    pub file_dir: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_config(config: &LecternConfig) -> Self {
        Self {
            level: config.log_level(),
            json: config.json_logs(),
            file_dir: config.toml.logging.file.then(|| config.log_dir()),
        }
    }

    /// Stderr only, used before a project is initialized.
    pub fn stderr(level: impl Into<String>, json: bool) -> Self {
        Self {
            level: level.into(),
            json,
            file_dir: None,
        }
    }
}

/// Pick the filter directive: `RUST_LOG`, then `LECTERN_LOG`, then the
/// configured level. Blank values are ignored.
pub fn filter_directive(rust_log: Option<&str>, lectern_log: Option<&str>, fallback: &str) -> String {
    [rust_log, lectern_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn build_filter(level: &str) -> EnvFilter {
    let rust_log = std::env::var("RUST_LOG").ok();
    let lectern_log = std::env::var(LOG_ENV).ok();
    let directive = filter_directive(rust_log.as_deref(), lectern_log.as_deref(), level);
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// so the file writer flushes.
pub fn init(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let stderr_layer = if settings.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match &settings.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(build_filter(&settings.level))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_wins() {
        assert_eq!(
            filter_directive(Some("lectern=trace"), Some("warn"), "info"),
            "lectern=trace"
        );
    }

    #[test]
    fn test_lectern_log_used_when_rust_log_blank() {
        assert_eq!(filter_directive(Some("  "), Some("warn"), "info"), "warn");
        assert_eq!(filter_directive(None, Some("debug"), "info"), "debug");
    }

    #[test]
    fn test_falls_back_to_configured_level() {
        assert_eq!(filter_directive(None, None, "error"), "error");
    }

    #[test]
    fn test_settings_follow_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LecternConfig {
            project_dir: dir.path().to_path_buf(),
            data_dir: dir.path().join(crate::config::DATA_DIR),
            toml: Default::default(),
            verbose: true,
            cli_json_logs: None,
        };
        config.toml.logging.file = true;

        let settings = LogSettings::from_config(&config);
        assert_eq!(settings.level, "debug");
        assert!(!settings.json);
        assert_eq!(settings.file_dir, Some(config.log_dir()));
    }
}
