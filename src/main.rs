use std::sync::Arc;

use anyhow::Result;
use mailhook_ingest::config::Config;
use mailhook_ingest::http_server;
use mailhook_ingest::pipeline::Pipeline;
use mailhook_ingest::sandbox::Sandbox;
use mailhook_ingest::store::JsonFileStore;
use mailhook_ingest::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    telemetry::init(config.json_logs)?;

    let store = Arc::new(JsonFileStore::open(&config.data_dir).await?);
    tracing::info!(
        data_dir = %store.data_dir().display(),
        memory_limit = config.limits.memory_bytes,
        max_stack_size = config.limits.stack_bytes,
        timeout_ms = config.limits.timeout.as_millis() as u64,
        "starting mailhook ingest"
    );

    let pipeline = Pipeline::new(
        store.clone(),
        store.clone(),
        store,
        Sandbox::new(config.limits.clone()),
    );

    http_server::serve(config.addr, Arc::new(pipeline), shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
