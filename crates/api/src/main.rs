use std::sync::Arc;

use anyhow::Context;
use safeexec_infra::ExecutorConfig;
use safeexec_infra::platform::DryRunPlatformClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    safeexec_observability::init();

    let config = ExecutorConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(safeexec_api::app::AppServices::build(config).await?);

    // In-memory state is process-local, so the worker loop has to run here.
    let worker = (!services.is_persistent()).then(|| {
        tracing::info!(worker_id = %services.config.worker_id, "starting embedded worker");
        services.worker_runner(Arc::new(DryRunPlatformClient::new())).spawn()
    });

    let app = safeexec_api::app::build_app(services);

    let bind_addr = std::env::var("SAFEEXEC_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    Ok(())
}
