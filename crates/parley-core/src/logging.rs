//! Tracing subscriber initialisation.
//!
//! Builds a `tracing_subscriber::fmt` subscriber from the `[logging]`
//! config section. `RUST_LOG` overrides the configured level filter.

use tracing_subscriber::EnvFilter;

use parley_config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// Safe to call multiple times — subsequent calls are silently ignored,
/// which keeps embedding hosts and tests from fighting over the global.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init(&config);
        init(&config);
        tracing::info!("still alive after double init");
    }
}
