use std::sync::Arc;

use datapull::{
    ingest_router, init_logging, log_app_bind, log_app_start, logging_config_from_env,
    pipeline_config_from_env, recover_orphaned_runs, CancelToken, DatasetRegistry,
    IngestionOrchestrator, RemoteClient, SqliteRegistry, TableStore,
};
use tracing::info;

const COMPONENT: &str = "ingest_server";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    let registry: Arc<dyn DatasetRegistry> = Arc::new(SqliteRegistry::open(&cfg.registry_path)?);
    recover_orphaned_runs(registry.as_ref())?;

    // blocking HTTP client is built and dropped outside the async runtime
    let cancel = CancelToken::new();
    let client = RemoteClient::new(cfg.remote.clone())?.with_cancel(cancel.clone());
    let orchestrator = Arc::new(
        IngestionOrchestrator::new(
            Arc::clone(&registry),
            client,
            TableStore::new(&cfg.storage_root),
            cfg.history_interval_seconds,
        )
        .with_workers(cfg.fetch_workers),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cfg.server_addr, Arc::clone(&orchestrator), cancel))?;
    drop(runtime);

    info!(component = COMPONENT, event = "app.stop");
    Ok(())
}

async fn serve(
    addr: std::net::SocketAddr,
    orchestrator: Arc<IngestionOrchestrator>,
    cancel: CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = ingest_router(orchestrator);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(COMPONENT, bound_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(component = COMPONENT, event = "app.shutdown", reason = "ctrl_c");
            cancel.cancel();
        })
        .await?;

    Ok(())
}
