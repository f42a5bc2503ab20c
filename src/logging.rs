use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

const LOG_ENV: &str = "FITSYNC_LOG";
const LOG_FILE_PREFIX: &str = "fitsync.log";

/// Keeps the background log writer alive. Hold it until exit.
pub struct LogGuard {
  _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Logs go to a daily rolling file under the configured directory (default
/// `$XDG_DATA_HOME/fitsync/logs`), or to stderr when no directory can be
/// resolved or created.
pub fn init(config: &LogConfig) -> Result<LogGuard> {
  let filter = EnvFilter::builder()
    .with_env_var(LOG_ENV)
    .try_from_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))?;

  let file_dir = log_dir(config).filter(|dir| std::fs::create_dir_all(dir).is_ok());

  let guard = match file_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;
      tracing::debug!(dir = %dir.display(), "logging to file");
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;
      None
    }
  };

  Ok(LogGuard { _file: guard })
}

fn log_dir(config: &LogConfig) -> Option<PathBuf> {
  config
    .directory
    .clone()
    .or_else(|| dirs::data_dir().map(|d| d.join("fitsync").join("logs")))
}
