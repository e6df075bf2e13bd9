mod collector;
mod config;
mod engine;
mod evaluator;
mod executor;
mod normalizer;
mod pool;
mod problems;
mod workspace;


use anyhow::Context;
use arbiter_common::config::Config;
use arbiter_common::store::RedisJobStore;
use config::WorkerConfig;
use engine::DockerEngine;
use pool::WorkerPool;
use problems::RedisTestSource;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Arbiter Worker booting...");

    let worker_config = WorkerConfig::load_default()
        .map_err(|e| {
            error!("Failed to load worker configuration: {:#}", e);
            e
        })?;
    let shared = Config::from_env();

    info!(
        worker_id = %worker_config.worker_id,
        concurrency = worker_config.concurrency,
        jobs_base = %worker_config.jobs_base.display(),
        image = %worker_config.sandbox.image,
        timeout_secs = worker_config.sandbox.timeout_secs,
        memory_mb = worker_config.sandbox.memory_limit_mb,
        "Worker configured"
    );

    let engine = DockerEngine::connect()?;
    engine.ping().await.context("Docker daemon is not reachable")?;
    engine.ensure_image(&worker_config.sandbox.image).await?;

    // One connection per slot: a blocking dequeue holds its connection
    let mut stores = Vec::with_capacity(worker_config.concurrency);
    for _ in 0..worker_config.concurrency {
        let store = RedisJobStore::connect(&shared, worker_config.worker_id.clone())
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", shared.redis_url))?;
        stores.push(store);
    }
    info!("Connected to Redis: {}", shared.redis_url);

    if let Some(store) = stores.first() {
        let recovery = store.recover_abandoned().await?;
        if recovery.failed > 0 || recovery.requeued > 0 {
            warn!(
                failed = recovery.failed,
                requeued = recovery.requeued,
                "Reconciled jobs left by a previous run of this worker"
            );
        }
    }

    let tests = RedisTestSource::connect(&shared)
        .await
        .context("Failed to open Redis connection for test lists")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Received shutdown signal, finishing in-flight jobs..."),
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let pool = WorkerPool::new(Arc::new(engine), Arc::new(tests), worker_config);
    pool.run(stores, shutdown_rx).await;

    info!("Worker shutdown complete");
    Ok(())
}
