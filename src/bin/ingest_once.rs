use std::sync::Arc;

use datapull::{
    init_logging, log_app_start, logging_config_from_env, pipeline_config_from_env,
    DatasetRegistry, IngestionOrchestrator, RemoteClient, SqliteRegistry, TableStore,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dataset = std::env::args()
        .nth(1)
        .ok_or("usage: ingest_once <dataset>")?;

    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("ingest_once", &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    let registry: Arc<dyn DatasetRegistry> = Arc::new(SqliteRegistry::open(&cfg.registry_path)?);
    let orchestrator = IngestionOrchestrator::new(
        registry,
        RemoteClient::new(cfg.remote.clone())?,
        TableStore::new(&cfg.storage_root),
        cfg.history_interval_seconds,
    )
    .with_workers(cfg.fetch_workers);

    let result = orchestrator.run(&dataset)?;
    println!(
        "{} | status={} rows={} cols={} interval_minutes={} path={}",
        result.dataset,
        result.status.as_str(),
        result.meta.n_rows,
        result.meta.n_cols,
        result.interval_minutes,
        result.meta.path
    );

    Ok(())
}
