use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Returns `false` if a subscriber was already installed (tests, embedding apps).
pub fn init_tracing(cfg: &LoggingConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let layer = if cfg.json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_ansi(false)
            .boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()
        .is_ok()
}
