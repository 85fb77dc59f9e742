//! Standalone worker process: claims and executes change requests until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use safeexec_api::app::AppServices;
use safeexec_infra::ExecutorConfig;
use safeexec_infra::platform::DryRunPlatformClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    safeexec_observability::init();

    let config = ExecutorConfig::from_env().context("invalid configuration")?;
    let services = AppServices::build(config).await?;
    if !services.is_persistent() {
        tracing::warn!("in-memory stores are not shared with the API process; nothing will be claimed");
    }

    let handle = services.worker_runner(Arc::new(DryRunPlatformClient::new())).spawn();

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, finishing in-flight batch");

    let stats = handle.stats();
    handle.shutdown().await;
    tracing::info!(?stats, "worker exited");
    Ok(())
}
