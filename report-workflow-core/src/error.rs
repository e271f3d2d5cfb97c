use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::stage::WorkflowState;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("report not found: {0}")]
    ReportNotFound(Uuid),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(
        "{operation} requires workflow state {}, report is {}",
        format_states(.expected),
        format_actual(.actual)
    )]
    PreconditionFailed {
        operation: String,
        expected: Vec<WorkflowState>,
        actual: Option<WorkflowState>,
    },

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl WorkflowError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ReportNotFound(_) | Self::NotFound(_) => 404,
            Self::PreconditionFailed { .. } => 412,
            Self::UnknownStage(_) | Self::InvalidInput(_) => 400,
            Self::Forbidden(_) => 403,
            Self::Unauthorized(_) => 401,
            Self::Conflict(_) => 409,
            Self::StoreUnavailable(_) => 503,
            Self::Timeout { .. } => 504,
            Self::Serialization(_) => 500,
            #[cfg(feature = "database")]
            Self::Database(_) => 503,
        }
    }

    pub fn precondition(
        operation: impl fmt::Display,
        expected: &[WorkflowState],
        actual: Option<WorkflowState>,
    ) -> Self {
        Self::PreconditionFailed {
            operation: operation.to_string(),
            expected: expected.to_vec(),
            actual,
        }
    }
}

fn format_states(states: &[WorkflowState]) -> String {
    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" or ")
}

fn format_actual(actual: &Option<WorkflowState>) -> &'static str {
    actual.map(|s| s.as_str()).unwrap_or("not a project report")
}
