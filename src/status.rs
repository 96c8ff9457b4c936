//! Per-run ingestion state machine.
//!
//! A run moves `Pending -> Running -> {Succeeded, Failed}`. Terminal states are
//! final for that run; a new run starts from a fresh [`RunState`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::DatasetMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition {from:?} -> {to:?}")]
pub struct StatusTransitionError {
    pub from: IngestionStatus,
    pub to: IngestionStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    status: IngestionStatus,
    interval_minutes: u32,
    meta: Option<DatasetMeta>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            status: IngestionStatus::Pending,
            interval_minutes: 0,
            meta: None,
        }
    }

    pub fn status(&self) -> IngestionStatus {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.status == IngestionStatus::Succeeded
    }

    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }

    pub fn meta(&self) -> Option<&DatasetMeta> {
        self.meta.as_ref()
    }

    pub fn start(&mut self) -> Result<(), StatusTransitionError> {
        self.advance(IngestionStatus::Running)
    }

    pub fn succeed(
        &mut self,
        interval_minutes: u32,
        meta: DatasetMeta,
    ) -> Result<(), StatusTransitionError> {
        self.advance(IngestionStatus::Succeeded)?;
        self.interval_minutes = interval_minutes;
        self.meta = Some(meta);
        Ok(())
    }

    pub fn fail(&mut self) -> Result<(), StatusTransitionError> {
        self.advance(IngestionStatus::Failed)
    }

    fn advance(&mut self, next: IngestionStatus) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusTransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
