use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    errors::{RmqError, RmqResult},
    options::LogFormat,
};

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(format: LogFormat) -> RmqResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);

    let result = match format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Pretty => builder.try_init(),
    };

    result.map_err(|e| RmqError::ConfigError(format!("tracing already initialised: {}", e)))
}
