use super::EXIT_SUCCESS;
use bridgekeeper_core::{Core, CoreConfig, CoreParts};
use tracing::info;

pub fn run(config: CoreConfig) -> Result<u8, String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start async runtime: {e}"))?;
    runtime.block_on(serve(config))
}

async fn serve(config: CoreConfig) -> Result<u8, String> {
    let parts = CoreParts::from_config(&config).map_err(|e| e.to_string())?;
    let core = Core::start(config, parts).await.map_err(|e| e.to_string())?;

    let interrupted = tokio::signal::ctrl_c().await;
    info!("interrupt received, shutting down");
    core.shutdown().await;
    interrupted.map_err(|e| format!("failed to wait for interrupt: {e}"))?;
    Ok(EXIT_SUCCESS)
}
