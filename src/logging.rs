//! Tracing subscriber setup driven by the `[general]` config section.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::GeneralConfig;

/// Subscriber initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// `log_format` is neither `json` nor `pretty`.
    #[error("unknown log format '{0}', expected 'json' or 'pretty'")]
    UnknownFormat(String),

    /// A global subscriber is already installed.
    #[error("failed to initialize tracing subscriber: {0}")]
    Init(String),
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `log_level` when set. Call once, before the run starts.
pub fn init_tracing(config: &GeneralConfig) -> Result<(), LoggingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string())),
        "pretty" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string())),
        other => Err(LoggingError::UnknownFormat(other.to_owned())),
    }
}
