mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use arbiter_common::config::Config;
use arbiter_common::store::{JobStore, RedisJobStore};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub store: Arc<dyn JobStore>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match std::env::var("LOG_FORMAT") {
        Ok(format) if format.eq_ignore_ascii_case("json") => builder.json().init(),
        _ => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Arbiter API booting...");

    let config = Config::from_env();
    let store = RedisJobStore::connect(&config, "api")
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;

    info!("Connected to Redis: {}", config.redis_url);

    let state = Arc::new(AppState {
        store: Arc::new(store),
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
