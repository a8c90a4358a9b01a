//! Logging setup for the layer.
//!
//! The layer lives inside someone else's process, so initialisation never
//! fails loudly: if the host already installed a global subscriber, ours is
//! simply not installed.

use crate::config::LoggingConfig;
use once_cell::sync::Lazy;
use std::path::Path;
use std::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_ENV_VAR: &str = "NOVADE_EFFECTS_LOG";

/// Keeps the file writer alive so buffered lines are flushed.
static LOG_WORKER_GUARD: Lazy<Mutex<Option<WorkerGuard>>> = Lazy::new(|| Mutex::new(None));

/// Builds the filter from `NOVADE_EFFECTS_LOG`, falling back to `config.level`.
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(format!("novade_frame_effects={}", config.level)))
}

/// Installs the global subscriber: stderr always, plus a file if configured.
pub fn init_logging(config: &LoggingConfig) {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(build_filter(config));

    let file = config.file_path.as_deref().map(|path| {
        let (writer, guard) = file_writer(path);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(build_filter(config));
        (layer, guard)
    });

    let (file_layer, guard) = match file {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        if let Ok(mut slot) = LOG_WORKER_GUARD.lock() {
            *slot = guard;
        }
        tracing::debug!("logging initialised at level '{}'", config.level);
    }
}

fn file_writer(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("frame-effects.log"));
    let appender = tracing_appender::rolling::never(directory, file_name);
    tracing_appender::non_blocking(appender)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        let config = LoggingConfig::default();
        init_logging(&config);
        init_logging(&config);
    }

    #[test]
    fn file_logging_creates_writer_in_target_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: "debug".to_string(),
            file_path: Some(dir.path().join("layer.log")),
        };
        init_logging(&config);
        tracing::info!("written by test");
    }
}
