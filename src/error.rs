//! Pipeline-wide error taxonomy.

use thiserror::Error;

use crate::registry::RegistryError;
use crate::status::StatusTransitionError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid date '{value}': expected YYYYMMDD")]
    InvalidDateFormat { value: String },
    #[error("start date {start} is after end date {end}")]
    InvalidDateRange { start: String, end: String },
    #[error("invalid time window {start}..{end}: expected HH:MM:SS with start <= end")]
    InvalidTimeWindow { start: String, end: String },
    #[error("invalid column id '{value}': expected a numeric point identifier")]
    InvalidColumnId { value: String },
    #[error("column {column} is requested more than once")]
    DuplicateColumn { column: String },
    #[error("task kind {task_kind} requires a target column")]
    MissingTarget { task_kind: String },
    #[error("unknown task kind '{value}'")]
    InvalidTaskKind { value: String },
    #[error("no data retrieved for column {column}: all {failed_days} day(s) failed, last error: {last_error}")]
    NoDataRetrieved {
        column: String,
        failed_days: usize,
        last_error: String,
    },
    #[error("merge produced no rows")]
    EmptyMerge,
    #[error("ingestion produced an empty table")]
    EmptyResult,
    #[error("dataset {0} not found")]
    DatasetNotFound(String),
    #[error("dataset {0} already has a run in progress")]
    RunInProgress(String),
    #[error("ingestion cancelled")]
    Cancelled,
    #[error("could not start fetch workers: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Transition(#[from] StatusTransitionError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl IngestError {
    /// Stable tag for logs and HTTP payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidDateFormat { .. } => "invalid_date_format",
            Self::InvalidDateRange { .. } => "invalid_date_range",
            Self::InvalidTimeWindow { .. } => "invalid_time_window",
            Self::InvalidColumnId { .. } => "invalid_column_id",
            Self::DuplicateColumn { .. } => "duplicate_column",
            Self::MissingTarget { .. } => "missing_target",
            Self::InvalidTaskKind { .. } => "invalid_task_kind",
            Self::NoDataRetrieved { .. } => "no_data_retrieved",
            Self::EmptyMerge => "empty_merge",
            Self::EmptyResult => "empty_result",
            Self::DatasetNotFound(_) => "dataset_not_found",
            Self::RunInProgress(_) => "run_in_progress",
            Self::Cancelled => "cancelled",
            Self::WorkerPool(_) => "worker_pool",
            Self::Transition(_) => "invalid_transition",
            Self::Registry(_) => "registry",
            Self::Storage(_) => "storage",
        }
    }

    /// Parameter validation failures, surfaced before any network call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidDateFormat { .. }
                | Self::InvalidDateRange { .. }
                | Self::InvalidTimeWindow { .. }
                | Self::InvalidColumnId { .. }
                | Self::DuplicateColumn { .. }
                | Self::MissingTarget { .. }
                | Self::InvalidTaskKind { .. }
        )
    }
}
