mod error;
mod routes;
mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};
use wastecam_common::config::Config;

use crate::routes::AppState;
use crate::store::PredictionStore;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let store = match PredictionStore::open(Path::new(&config.collector.db_path), config.collector.history) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, path = config.collector.db_path, "failed to open prediction database");
            std::process::exit(1);
        }
    };

    let app = routes::router(Arc::new(AppState { store }));

    let addr = format!("0.0.0.0:{}", config.collector.port);
    info!(addr, history = config.collector.history, "wastecam collector starting");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr, error = %e, "failed to bind collector");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "collector stopped");
        std::process::exit(1);
    }
}
