//! Logging setup for the provisioner
//!
//! Onboard units ship logs as JSON lines; developers usually want compact or
//! pretty output on stderr. The mode is chosen by the host binary or from
//! `PROVISIONER_LOG_MODE`.

use std::str::FromStr;

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Environment variable selecting the [`LoggingMode`].
pub const LOG_MODE_ENV: &str = "PROVISIONER_LOG_MODE";

/// Environment variable overriding the log filter. Falls back to `RUST_LOG`.
pub const LOG_LEVEL_ENV: &str = "PROVISIONER_LOG_LEVEL";

/// Logging mode for different deployments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No subscriber is installed
    Silent,
    /// Compact stderr output at info level
    Development,
    /// Pretty output with thread ids and source locations at debug level
    Debug,
    /// One JSON object per event, for log shipping
    Json,
}

impl FromStr for LoggingMode {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" => Ok(LoggingMode::Silent),
            "development" | "dev" => Ok(LoggingMode::Development),
            "debug" => Ok(LoggingMode::Debug),
            "json" => Ok(LoggingMode::Json),
            other => Err(LoggingError::InvalidEnv(format!("unknown logging mode '{other}'"))),
        }
    }
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidEnv(String),
}

/// Install the global tracing subscriber for `mode`.
///
/// Call once, early in `main`. A second call fails with
/// [`LoggingError::TracingInit`].
///
/// ```rust,ignore
/// vehicle::logging::init_logging(LoggingMode::Json)?;
/// ```
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let result = match mode {
        LoggingMode::Silent => return Ok(()),
        LoggingMode::Development => Registry::default()
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .compact(),
            )
            .with(create_env_filter("info")?)
            .try_init(),
        LoggingMode::Debug => Registry::default()
            .with(
                fmt::layer()
                    .pretty()
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(create_env_filter("debug")?)
            .try_init(),
        LoggingMode::Json => Registry::default()
            .with(fmt::layer().json().with_current_span(false))
            .with(create_env_filter("info")?)
            .try_init(),
    };

    result.map_err(|e| LoggingError::TracingInit(e.to_string()))
}

/// Initialize logging from `PROVISIONER_LOG_MODE`, defaulting to Development.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var(LOG_MODE_ENV) {
        Ok(value) => value.parse()?,
        Err(_) => LoggingMode::Development,
    };
    init_logging(mode)
}

/// `PROVISIONER_LOG_LEVEL`, then `RUST_LOG`, then `default_level`.
fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directives = std::env::var(LOG_LEVEL_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    EnvFilter::try_new(&directives)
        .map_err(|e| LoggingError::InvalidEnv(format!("'{directives}': {e}")))
}

/// Whether a global subscriber has already been installed.
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_silent_mode() {
        assert!(init_logging(LoggingMode::Silent).is_ok());
    }

    #[rstest]
    #[case("silent", LoggingMode::Silent)]
    #[case("Development", LoggingMode::Development)]
    #[case("dev", LoggingMode::Development)]
    #[case(" debug ", LoggingMode::Debug)]
    #[case("JSON", LoggingMode::Json)]
    fn test_mode_from_str(#[case] input: &str, #[case] expected: LoggingMode) {
        assert_eq!(input.parse::<LoggingMode>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_mode() {
        assert!(matches!(
            "verbose".parse::<LoggingMode>(),
            Err(LoggingError::InvalidEnv(_))
        ));
    }
}
