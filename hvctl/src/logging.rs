//! Logging initialisation for the `hvctl` binary.
//!
//! Logs go to stderr, filtered by `HVCTL_LOG` (falling back to `RUST_LOG`), and to
//! a daily rolling file under `<settings>/logs`.
//!
//! The returned guard must be kept alive for the duration of the process so
//! that buffered log lines are flushed on exit.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use hvctl_shared::{HvctlError, HvctlResult};

use crate::constants::{LOG_FILE_PREFIX, envs};
use crate::layout::SettingsLayout;

pub struct LogGuard {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Install the global subscriber.
///
/// `default_level` applies when neither `HVCTL_LOG` nor `RUST_LOG` is set.
pub fn init_logging(layout: &SettingsLayout, default_level: &str) -> HvctlResult<LogGuard> {
    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        HvctlError::Storage(format!(
            "Failed to create log directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(&logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init()
        .map_err(|e| HvctlError::Internal(format!("Failed to install logger: {}", e)))?;

    Ok(LogGuard { _file_guard: guard })
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(envs::HVCTL_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level))
}
