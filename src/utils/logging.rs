//! Structured logging setup.
//!
//! Installs a global `tracing-subscriber` fmt subscriber from a
//! [`LoggingConfig`]. `RUST_LOG` takes precedence over the configured level.
//! When `log_to_file` is set the file is the sink; otherwise output goes to
//! stderr/stdout.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install the global subscriber described by `config`.
///
/// Calling this again after a subscriber is installed is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let file = if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("log_file_path must be set when log_to_file is true".into())
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}")))?;
        Some(file)
    } else {
        None
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match (config.json_format, file) {
        (true, Some(file)) => builder.json().with_writer(Mutex::new(file)).try_init(),
        (true, None) => builder.json().try_init(),
        (false, Some(file)) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        (false, None) => builder.try_init(),
    };

    match installed {
        Ok(()) => debug!(app = %config.app_name, "Logging initialized"),
        Err(e) => debug!(error = %e, "Global subscriber already installed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_file_logging_requires_path() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: None,
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(ProtocolError::ConfigError(_))
        ));
    }
}
