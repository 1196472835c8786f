//! Tracing (logging)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directives used when neither `--log-filter` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "h5lens=debug,tower_http=debug";

/// Returns the filter for `directives`, falling back to the `RUST_LOG` environment variable and
/// then to [DEFAULT_FILTER].
pub fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialise tracing (logging)
///
/// # Arguments
///
/// * `directives`: Filter directives from the command line, e.g. `h5lens=info`
pub fn init_tracing(directives: Option<&str>) {
    tracing_subscriber::registry()
        .with(env_filter(directives))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
