//! Logging initialisation with a reloadable filter.

use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::config::LoggingSettings;
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "herald=info";

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed subscriber.
///
/// Holds the file writer guard, if any; drop it only at process exit.
pub struct LoggingHandle {
    handle: FilterHandle,
    _guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the active filter directive.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }
}

/// Pick the initial filter: `RUST_LOG`, then configuration, then the default.
pub fn initial_filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            settings
                .filter
                .as_deref()
                .and_then(|directive| EnvFilter::try_new(directive).ok())
        })
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber.
pub fn init_logging(settings: &LoggingSettings) -> Result<LoggingHandle> {
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter(settings));

    let json_layer = settings
        .json
        .then(|| fmt::layer().json().with_target(true));
    let text_layer = (!settings.json).then(|| fmt::layer().with_ansi(true));

    let (file_writer, guard) = match settings.directory.as_deref() {
        Some(dir) => {
            let (writer, guard) = file_writer(dir, &settings.file_prefix)?;
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    let file_layer =
        file_writer.map(|writer| fmt::layer().with_writer(writer).with_ansi(false));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(LoggingHandle {
        handle: filter_handle,
        _guard: guard,
    })
}

/// Daily-rotated, non-blocking file writer.
fn file_writer(dir: &Path, prefix: &str) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;

    let file_appender = tracing_appender::rolling::daily(dir, prefix);
    Ok(tracing_appender::non_blocking(file_appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_filter_used_without_rust_log() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let settings = LoggingSettings {
            filter: Some("herald=debug".to_string()),
            ..Default::default()
        };
        assert_eq!(initial_filter(&settings).to_string(), "herald=debug");
    }

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("herald=info"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs");
        let (_writer, _guard) = file_writer(&nested, "herald.log").unwrap();
        assert!(nested.is_dir());
    }
}
