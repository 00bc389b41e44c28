//! tracing setup. Stdout is reserved for command output, so logs go to a file
//! in the data directory, or to stderr when file logging is off.

use std::fs;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "vibely.log";

/// Keeps the non-blocking writer flushing until dropped.
pub struct LogGuard {
  _guard: Option<WorkerGuard>,
}

pub fn log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|dir| dir.join("vibely").join("logs"))
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: &LogConfig) -> LogGuard {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .unwrap_or_else(|_| EnvFilter::new("info"));

  let mut setup_error = None;
  let file = if config.file {
    match log_dir() {
      Some(dir) => match fs::create_dir_all(&dir) {
        Ok(()) => {
          let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
          Some(tracing_appender::non_blocking(appender))
        }
        Err(e) => {
          setup_error = Some(format!("log dir init failed for {}: {}", dir.display(), e));
          None
        }
      },
      None => {
        setup_error = Some("no data directory for log files".to_string());
        None
      }
    }
  } else {
    None
  };

  let (file_layer, guard) = match file {
    Some((writer, guard)) => (
      Some(fmt::layer().with_writer(writer).with_ansi(false).with_target(true)),
      Some(guard),
    ),
    None => (None, None),
  };
  let stderr_layer = file_layer
    .is_none()
    .then(|| fmt::layer().compact().with_writer(std::io::stderr));

  Registry::default()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .init();

  if let Some(error) = setup_error {
    tracing::warn!("{}", error);
  }

  LogGuard { _guard: guard }
}
