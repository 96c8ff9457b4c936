//! Ingestion run orchestration: load, claim, fetch, merge, store, finalize.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{error, info, info_span, warn};

use crate::dataset::DatasetParams;
use crate::error::IngestError;
use crate::merge::{merge, MergeOutcome, MergeReport, MergedTable};
use crate::observability::log_recovery;
use crate::range::{ColumnSeries, FetchPlan, RangeFetcher};
use crate::registry::{ClaimOutcome, DatasetMeta, DatasetRegistry, DeleteOutcome};
use crate::remote::{CancelToken, RemoteClient};
use crate::status::{IngestionStatus, RunState};
use crate::storage::{TableStore, TIME_COLUMN};

#[derive(Debug, Clone, PartialEq)]
pub struct IngestionResult {
    pub dataset: String,
    pub status: IngestionStatus,
    pub is_valid: bool,
    pub interval_minutes: u32,
    pub meta: DatasetMeta,
    pub report: MergeReport,
    pub table: MergedTable,
}

pub struct IngestionOrchestrator {
    registry: Arc<dyn DatasetRegistry>,
    client: RemoteClient,
    store: TableStore,
    sampling_interval_seconds: u32,
    workers: usize,
}

struct CompletedRun {
    outcome: MergeOutcome,
    meta: DatasetMeta,
}

impl IngestionOrchestrator {
    pub fn new(
        registry: Arc<dyn DatasetRegistry>,
        client: RemoteClient,
        store: TableStore,
        sampling_interval_seconds: u32,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            sampling_interval_seconds,
            workers: 1,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<dyn DatasetRegistry> {
        &self.registry
    }

    pub fn client(&self) -> &RemoteClient {
        &self.client
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.client.cancel_token()
    }

    /// Runs one ingestion for `name`. Every failure after the claim leaves the
    /// dataset `failed` and is returned to the caller.
    pub fn run(&self, name: &str) -> Result<IngestionResult, IngestError> {
        let span = info_span!("ingest", dataset = name);
        let _entered = span.enter();

        let record = self.registry.load(name)?.ok_or_else(|| {
            warn!(
                component = "pipeline",
                event = "pipeline.run.rejected",
                dataset = name,
                reason = "not_found"
            );
            IngestError::DatasetNotFound(name.to_string())
        })?;

        match self.registry.claim_run(name)? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::NotFound => return Err(IngestError::DatasetNotFound(name.to_string())),
            ClaimOutcome::AlreadyRunning => {
                warn!(
                    component = "pipeline",
                    event = "pipeline.run.rejected",
                    dataset = name,
                    reason = "already_running"
                );
                return Err(IngestError::RunInProgress(name.to_string()));
            }
        }

        let mut state = RunState::new();
        state.start()?;
        info!(
            component = "pipeline",
            event = "pipeline.run.started",
            dataset = name,
            task_kind = record.params.task_kind.as_str(),
            start_date = %record.params.start_date,
            end_date = %record.params.end_date
        );

        let completed = match self.execute(&record.params) {
            Ok(completed) => completed,
            Err(err) => return Err(self.finish_failed(name, &mut state, err)),
        };

        let mut succeeded = state.clone();
        if let Err(err) =
            succeeded.succeed(completed.outcome.interval_minutes, completed.meta.clone())
        {
            return Err(self.finish_failed(name, &mut state, err.into()));
        }
        if let Err(err) = self.registry.store_run_state(name, &succeeded) {
            return Err(self.finish_failed(name, &mut state, err.into()));
        }

        info!(
            component = "pipeline",
            event = "pipeline.run.succeeded",
            dataset = name,
            rows = completed.meta.n_rows,
            cols = completed.meta.n_cols,
            missing_values = completed.meta.missing_values,
            unfilled_values = completed.meta.unfilled_values,
            interval_minutes = completed.outcome.interval_minutes
        );

        Ok(IngestionResult {
            dataset: name.to_string(),
            status: succeeded.status(),
            is_valid: succeeded.is_valid(),
            interval_minutes: succeeded.interval_minutes(),
            meta: completed.meta,
            report: completed.outcome.report,
            table: completed.outcome.table,
        })
    }

    /// Drops the registry row and the dataset's storage directory.
    /// A dataset with a run in progress is left untouched.
    pub fn delete_dataset(&self, name: &str) -> Result<(), IngestError> {
        match self.registry.delete(name)? {
            DeleteOutcome::Deleted => {}
            DeleteOutcome::NotFound => return Err(IngestError::DatasetNotFound(name.to_string())),
            DeleteOutcome::Running => {
                warn!(
                    component = "pipeline",
                    event = "pipeline.delete.rejected",
                    dataset = name,
                    reason = "already_running"
                );
                return Err(IngestError::RunInProgress(name.to_string()));
            }
        }

        let removed_files = self.store.remove_dataset(name)?;
        info!(
            component = "pipeline",
            event = "pipeline.dataset.deleted",
            dataset = name,
            removed_files
        );
        Ok(())
    }

    fn execute(&self, params: &DatasetParams) -> Result<CompletedRun, IngestError> {
        let resolved = params.resolve()?;
        let plan = FetchPlan::build(&resolved);
        info!(
            component = "pipeline",
            event = "pipeline.plan.built",
            dataset = %params.name,
            columns = plan.columns.len(),
            calls = plan.total_calls()
        );

        let fetcher = RangeFetcher::new(&self.client, self.sampling_interval_seconds)
            .with_workers(self.workers);
        let mut series: Vec<ColumnSeries> = Vec::with_capacity(plan.columns.len());
        for column_plan in &plan.columns {
            if self.cancel_token().is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            series.push(fetcher.fetch_column(column_plan, &plan.window)?);
        }

        let outcome = merge(&series)?;
        // rows that carry only nulls are not worth storing
        if outcome.table.is_empty() || !outcome.table.has_values() {
            return Err(IngestError::EmptyResult);
        }
        if self.cancel_token().is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let stored = self.store.write_table(&params.name, &outcome.table)?;
        let mut columns = Vec::with_capacity(outcome.table.columns.len() + 1);
        columns.push(TIME_COLUMN.to_string());
        columns.extend(outcome.table.columns.iter().cloned());

        let meta = DatasetMeta {
            created_at: Utc::now()
                .with_timezone(&self.client.config().utc_offset)
                .to_rfc3339_opts(SecondsFormat::Secs, false),
            n_rows: outcome.table.n_rows() as u64,
            n_cols: columns.len() as u64,
            missing_values: outcome.report.missing_before_fill as u64,
            unfilled_values: outcome.report.missing_after_fill as u64,
            columns,
            path: stored.path.display().to_string(),
            size_bytes: stored.size_bytes,
            sha256: stored.sha256,
        };

        Ok(CompletedRun { outcome, meta })
    }

    fn finish_failed(&self, name: &str, state: &mut RunState, err: IngestError) -> IngestError {
        if let Err(transition) = state.fail() {
            error!(
                component = "pipeline",
                event = "pipeline.state.invalid",
                dataset = name,
                error = %transition
            );
        }
        if let Err(persist) = self.registry.store_run_state(name, state) {
            error!(
                component = "pipeline",
                event = "pipeline.state.persist_failed",
                dataset = name,
                error = %persist
            );
        }

        error!(
            component = "pipeline",
            event = "pipeline.run.failed",
            dataset = name,
            error_kind = err.kind(),
            error = %err
        );
        err
    }
}

/// Fails every dataset left `running` by a previous process.
pub fn recover_orphaned_runs(registry: &dyn DatasetRegistry) -> Result<Vec<String>, IngestError> {
    let recovered = registry.reconcile_orphaned_runs()?;
    log_recovery(&recovered);
    Ok(recovered)
}
