//! Tracing subscriber setup.
//!
//! stdout is the chat surface, so logs go to a daily rolling file unless
//! stderr is requested explicitly. `RUST_LOG` overrides the default filter.

use crate::config::LoggingConfig;
use crate::error::{DeckError, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "codedeck=info,reqwest=warn,hyper=warn";

/// Where log lines are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Daily rolling file in this directory.
    File(PathBuf),
    Stderr,
}

impl LogTarget {
    pub fn from_config(config: &LoggingConfig, stderr: bool) -> Self {
        if stderr {
            Self::Stderr
        } else {
            Self::File(config.effective_log_dir())
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process so buffered lines are flushed on exit.
///
/// # Errors
///
/// Returns [`DeckError::Config`] if the log directory cannot be created or a
/// subscriber is already installed.
pub fn init(config: &LoggingConfig, target: &LogTarget) -> Result<Option<WorkerGuard>> {
    match target {
        LogTarget::Stderr => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| DeckError::Config(format!("logging: {e}")))?;
            Ok(None)
        }
        LogTarget::File(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| DeckError::Config(format!("logging: {e}")))?;
            Ok(Some(guard))
        }
    }
}
