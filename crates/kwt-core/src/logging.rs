use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

/// Initialize tracing for a service binary.
///
/// `RUST_LOG` wins when set; otherwise the configured level is used. Safe to
/// call more than once (tests) -- later calls are no-ops.
pub fn init(service_name: &str, log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level.clone()));

    if log.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .try_init()
            .ok();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .try_init()
            .ok();
    }

    tracing::info!(service = service_name, json = log.json, "logging initialised");
}
