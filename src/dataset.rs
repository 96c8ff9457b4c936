//! Dataset parameters and their validated, typed form.

use std::collections::HashSet;
use std::fmt;

use chrono::{Days, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

pub const DATE_FORMAT: &str = "%Y%m%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
pub const DEFAULT_TIME_START: &str = "00:00:00";
pub const DEFAULT_TIME_END: &str = "23:59:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Classification,
    Regression,
    Clustering,
    TimeSeries,
    Anomaly,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        Self::Classification,
        Self::Regression,
        Self::Clustering,
        Self::TimeSeries,
        Self::Anomaly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classification => "Classification",
            Self::Regression => "Regression",
            Self::Clustering => "Clustering",
            Self::TimeSeries => "TimeSeries",
            Self::Anomaly => "Anomaly",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        let trimmed = raw.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| IngestError::InvalidTaskKind {
                value: raw.to_string(),
            })
    }

    /// Supervised tasks fetch the target column alongside the features.
    pub fn is_supervised(self) -> bool {
        matches!(self, Self::Classification | Self::Regression)
    }
}

/// Numeric point identifier in the remote system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnId(u64);

impl ColumnId {
    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        raw.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| IngestError::InvalidColumnId {
                value: raw.to_string(),
            })
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn parse(start: &str, end: &str) -> Result<Self, IngestError> {
        let start_date = parse_date(start)?;
        let end_date = parse_date(end)?;
        if start_date > end_date {
            return Err(IngestError::InvalidDateRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self {
            start: start_date,
            end: end_date,
        })
    }

    /// Every calendar day in the inclusive span, ascending.
    pub fn days(&self) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut day = self.start;
        while day <= self.end {
            out.push(day);
            match day.checked_add_days(Days::new(1)) {
                Some(next) => day = next,
                None => break,
            }
        }
        out
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, IngestError> {
    let trimmed = raw.trim();
    if trimmed.len() != 8 {
        return Err(IngestError::InvalidDateFormat {
            value: raw.to_string(),
        });
    }
    NaiveDate::parse_from_str(trimmed, DATE_FORMAT).map_err(|_| IngestError::InvalidDateFormat {
        value: raw.to_string(),
    })
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn parse(start: &str, end: &str) -> Result<Self, IngestError> {
        let invalid = || IngestError::InvalidTimeWindow {
            start: start.to_string(),
            end: end.to_string(),
        };
        let start_time = NaiveTime::parse_from_str(start.trim(), TIME_FORMAT).map_err(|_| invalid())?;
        let end_time = NaiveTime::parse_from_str(end.trim(), TIME_FORMAT).map_err(|_| invalid())?;
        if start_time > end_time {
            return Err(invalid());
        }
        Ok(Self {
            start: start_time,
            end: end_time,
        })
    }

    pub fn start_text(&self) -> String {
        self.start.format(TIME_FORMAT).to_string()
    }

    pub fn end_text(&self) -> String {
        self.end.format(TIME_FORMAT).to_string()
    }
}

/// Requested dataset parameters as held by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetParams {
    pub name: String,
    pub task_kind: TaskKind,
    #[serde(default)]
    pub description: String,
    pub features: Vec<String>,
    #[serde(default)]
    pub target: Option<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "default_time_start")]
    pub time_start: String,
    #[serde(default = "default_time_end")]
    pub time_end: String,
}

fn default_time_start() -> String {
    DEFAULT_TIME_START.to_string()
}

fn default_time_end() -> String {
    DEFAULT_TIME_END.to_string()
}

/// Parameters after validation; everything a run needs to plan its fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParams {
    pub columns: Vec<ColumnId>,
    pub span: DateSpan,
    pub window: TimeWindow,
}

impl DatasetParams {
    /// Feature columns followed by the target when the task is supervised.
    pub fn required_columns(&self) -> Result<Vec<String>, IngestError> {
        let mut columns = self.features.clone();
        if self.task_kind.is_supervised() {
            match self.target.as_deref().map(str::trim) {
                Some(target) if !target.is_empty() => columns.push(target.to_string()),
                _ => {
                    return Err(IngestError::MissingTarget {
                        task_kind: self.task_kind.as_str().to_string(),
                    })
                }
            }
        }
        Ok(columns)
    }

    pub fn resolve(&self) -> Result<ResolvedParams, IngestError> {
        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for raw in self.required_columns()? {
            let column = ColumnId::parse(&raw)?;
            if !seen.insert(column) {
                return Err(IngestError::DuplicateColumn {
                    column: column.to_string(),
                });
            }
            columns.push(column);
        }

        Ok(ResolvedParams {
            columns,
            span: DateSpan::parse(&self.start_date, &self.end_date)?,
            window: TimeWindow::parse(&self.time_start, &self.time_end)?,
        })
    }
}
