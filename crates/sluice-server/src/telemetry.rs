//! Tracing setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins, then `-v` flags, then the configured filter.
pub fn init_tracing(verbosity: u8, configured: Option<&str>) {
    let fallback = match (verbosity, configured) {
        (0, Some(filter)) => filter.to_string(),
        (0, None) => "info,sqlx=warn".to_string(),
        (1, _) => "debug,sqlx=warn".to_string(),
        (2, _) => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
