//! Datapull core crate.
//!
//! Current implemented scope:
//! - retrying client for the remote realtime and history endpoints
//! - per-column multi-day range fetch with day-level failure absorption
//! - outer-join merge, forward-fill and median interval inference
//! - dataset run state machine, SQLite registry and CSV table storage
//! - ingestion orchestration, dataset deletion and their HTTP surface

mod config;
mod dataset;
mod error;
mod merge;
mod observability;
mod pipeline;
mod range;
mod registry;
mod remote;
mod server;
mod status;
mod storage;

pub use config::{
    parse_utc_offset, pipeline_config_from_env, ConfigError, PipelineConfig,
    DEFAULT_FETCH_WORKERS, DEFAULT_HISTORY_INTERVAL_SECONDS, DEFAULT_SERVER_ADDR,
    DEFAULT_STORAGE_ROOT,
};
pub use dataset::{
    format_date, parse_date, ColumnId, DatasetParams, DateSpan, ResolvedParams, TaskKind,
    TimeWindow, DATE_FORMAT, DEFAULT_TIME_END, DEFAULT_TIME_START, TIME_FORMAT,
};
pub use error::IngestError;
pub use merge::{
    forward_fill, infer_interval_minutes, merge, MergeOutcome, MergeReport, MergedTable, TableRow,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_recovery, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError, LOG_FILE_NAME,
};
pub use pipeline::{recover_orphaned_runs, IngestionOrchestrator, IngestionResult};
pub use range::{ColumnPlan, ColumnSeries, FetchPlan, RangeFetcher};
pub use registry::{
    ClaimOutcome, DatasetMeta, DatasetRecord, DatasetRegistry, DeleteOutcome, RegistryError,
    SqliteRegistry,
};
pub use remote::{
    default_utc_offset, CancelToken, HistoryPoint, HttpReply, RemoteClient, RemoteConfig,
    RemoteError, RemoteTransport, ReqwestTransport, RetryPolicy, Sleeper, ThreadSleeper,
    TransportError, TransportErrorKind,
};
pub use server::{ingest_router, DatasetRequest, ListQuery};
pub use status::{IngestionStatus, RunState, StatusTransitionError};
pub use storage::{StorageError, StoredTable, TableStore, TABLE_FILE_NAME, TIME_COLUMN};
