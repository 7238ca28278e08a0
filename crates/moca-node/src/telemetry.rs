//! Tracing subscriber setup

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{NodeError, NodeResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` wins over `logging.level`; `verbose` forces `debug`.
pub fn init(logging: &LoggingConfig, verbose: bool) -> NodeResult<()> {
    let env_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&logging.level))
            .map_err(|e| NodeError::Telemetry(e.to_string()))?
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match logging.format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_file(false))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true).with_current_span(false))
            .try_init(),
    };
    installed.map_err(|e| NodeError::Telemetry(e.to_string()))
}
