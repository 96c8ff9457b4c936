//! Multi-day fetch for one column: one history call per calendar day.

use chrono::NaiveDate;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::{dispatcher, info, warn, Span};

use crate::dataset::{format_date, ColumnId, DateSpan, ResolvedParams, TimeWindow};
use crate::error::IngestError;
use crate::remote::{HistoryPoint, RemoteClient, RemoteError};

/// One column's points across the span, ascending by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSeries {
    pub column: String,
    pub points: Vec<HistoryPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    pub column: ColumnId,
    pub days: Vec<NaiveDate>,
}

/// Work-list of (column, day) fetches in required-column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub columns: Vec<ColumnPlan>,
    pub window: TimeWindow,
}

impl FetchPlan {
    pub fn build(params: &ResolvedParams) -> Self {
        let days = params.span.days();
        Self {
            columns: params
                .columns
                .iter()
                .map(|column| ColumnPlan {
                    column: *column,
                    days: days.clone(),
                })
                .collect(),
            window: params.window,
        }
    }

    pub fn total_calls(&self) -> usize {
        self.columns.iter().map(|plan| plan.days.len()).sum()
    }
}

type DayResult = Result<Vec<HistoryPoint>, RemoteError>;

pub struct RangeFetcher<'a> {
    client: &'a RemoteClient,
    sampling_interval_seconds: u32,
    workers: usize,
}

impl<'a> RangeFetcher<'a> {
    pub fn new(client: &'a RemoteClient, sampling_interval_seconds: u32) -> Self {
        Self {
            client,
            sampling_interval_seconds,
            workers: 1,
        }
    }

    /// Days of one column are fetched on at most `workers` threads. 1 means sequential.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Validates dates and window before any network call.
    pub fn fetch_feature_range(
        &self,
        column: &str,
        start_date: &str,
        end_date: &str,
        time_start: &str,
        time_end: &str,
    ) -> Result<ColumnSeries, IngestError> {
        let column = ColumnId::parse(column)?;
        let span = DateSpan::parse(start_date, end_date)?;
        let window = TimeWindow::parse(time_start, time_end)?;
        self.fetch_column(
            &ColumnPlan {
                column,
                days: span.days(),
            },
            &window,
        )
    }

    pub fn fetch_column(
        &self,
        plan: &ColumnPlan,
        window: &TimeWindow,
    ) -> Result<ColumnSeries, IngestError> {
        let results = if self.workers <= 1 || plan.days.len() <= 1 {
            self.fetch_days_sequential(plan, window)?
        } else {
            self.fetch_days_pooled(plan, window)?
        };

        let mut points = Vec::new();
        let mut failed_days = 0;
        let mut last_error = None;

        for (day, result) in plan.days.iter().zip(results) {
            match result {
                Ok(day_points) => points.extend(day_points),
                Err(RemoteError::Cancelled) => return Err(IngestError::Cancelled),
                Err(err) => {
                    failed_days += 1;
                    warn!(
                        component = "range_fetcher",
                        event = "range.day.skipped",
                        column = %plan.column,
                        date = %format_date(*day),
                        error_kind = err.kind(),
                        error = %err
                    );
                    last_error = Some(err);
                }
            }
        }

        if failed_days == plan.days.len() {
            let last_error = last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no days requested".to_string());
            return Err(IngestError::NoDataRetrieved {
                column: plan.column.to_string(),
                failed_days,
                last_error,
            });
        }

        info!(
            component = "range_fetcher",
            event = "range.column.fetched",
            column = %plan.column,
            days = plan.days.len(),
            failed_days,
            points = points.len()
        );

        Ok(ColumnSeries {
            column: plan.column.to_string(),
            points,
        })
    }

    fn fetch_day(&self, column: ColumnId, day: NaiveDate, window: &TimeWindow) -> DayResult {
        if self.client.cancel_token().is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        self.client
            .fetch_history(column, day, window, self.sampling_interval_seconds)
    }

    fn fetch_days_sequential(
        &self,
        plan: &ColumnPlan,
        window: &TimeWindow,
    ) -> Result<Vec<DayResult>, IngestError> {
        let mut results = Vec::with_capacity(plan.days.len());
        for day in &plan.days {
            let result = self.fetch_day(plan.column, *day, window);
            if matches!(result, Err(RemoteError::Cancelled)) {
                return Err(IngestError::Cancelled);
            }
            results.push(result);
        }
        Ok(results)
    }

    fn fetch_days_pooled(
        &self,
        plan: &ColumnPlan,
        window: &TimeWindow,
    ) -> Result<Vec<DayResult>, IngestError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers.min(plan.days.len()))
            .thread_name(|idx| format!("datapull-day-{idx}"))
            .build()?;
        // workers log under the caller's subscriber and span
        let dispatch = dispatcher::get_default(|current| current.clone());
        let span = Span::current();

        let results: Vec<DayResult> = pool.install(|| {
            plan.days
                .par_iter()
                .map(|day| {
                    dispatcher::with_default(&dispatch, || {
                        span.in_scope(|| self.fetch_day(plan.column, *day, window))
                    })
                })
                .collect()
        });

        if results
            .iter()
            .any(|result| matches!(result, Err(RemoteError::Cancelled)))
        {
            return Err(IngestError::Cancelled);
        }
        Ok(results)
    }
}
