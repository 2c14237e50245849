//! Logging setup for processes hosting the allocator.
//!
//! The allocator itself only emits `tracing` events. Hosts that do not install
//! their own subscriber can call one of the initializers here.

use crate::config::LoggingConfig;
use crate::error::GrallocError;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a stderr subscriber filtered by `RUST_LOG`, defaulting to "info".
/// Does nothing if a global subscriber is already set.
pub fn init_minimal_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .try_init();
}

fn parse_level(level: &str) -> Result<Level, GrallocError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(GrallocError::LoggingInitialization(format!("Invalid log level in config: {other}"))),
    }
}

/// Installs a stderr subscriber configured by `config`.
///
/// # Errors
///
/// Fails on an invalid level or when a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), GrallocError> {
    let filter = EnvFilter::new(parse_level(&config.level)?.to_string());
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match config.format.to_lowercase().as_str() {
        "json" => builder.json().with_ansi(false).try_init(),
        _ => builder.with_ansi(atty::is(atty::Stream::Stderr)).try_init(),
    };
    result.map_err(|e| GrallocError::LoggingInitialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("warn").unwrap(), Level::WARN);
        assert!(matches!(parse_level("verbose"), Err(GrallocError::LoggingInitialization(_))));
    }

    #[test]
    fn test_init_logging_rejects_invalid_level() {
        let config = LoggingConfig {
            level: "chatty".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_minimal_logging_is_idempotent() {
        init_minimal_logging();
        init_minimal_logging();
        tracing::info!("minimal logging initialized twice");
    }
}
