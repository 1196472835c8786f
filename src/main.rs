//! This file defines the h5lens binary entry point.

use h5lens::app;
use h5lens::app_state::AppState;
use h5lens::cli;
use h5lens::metrics;
use h5lens::server;
use h5lens::tracing;

use std::sync::Arc;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing(args.log_filter.as_deref());
    metrics::register_metrics();
    let state = Arc::new(AppState::new(&args));
    let router = app::router(state);
    if let Err(err) = server::serve(&args, router).await {
        ::tracing::error!("server failed: {}", err);
        std::process::exit(1);
    }
}
