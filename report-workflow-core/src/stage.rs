//! Stage Vocabulary and Workflow States
//!
//! The fixed set of stage keys a project report can confirm, and the ordered
//! state graph of the project workflow. Both are declared once here; every
//! other module refers to these enums rather than raw strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::WorkflowError;

/// Stable key naming one workflow stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageId {
    TeamAcceptance,
    ConcreteWorks,
    SecondPayment,
    InstallationComplete,
    DeliveryHandover,
}

impl StageId {
    pub const ALL: [StageId; 5] = [
        StageId::TeamAcceptance,
        StageId::ConcreteWorks,
        StageId::SecondPayment,
        StageId::InstallationComplete,
        StageId::DeliveryHandover,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TeamAcceptance => "teamAcceptance",
            Self::ConcreteWorks => "concreteWorks",
            Self::SecondPayment => "secondPayment",
            Self::InstallationComplete => "installationComplete",
            Self::DeliveryHandover => "deliveryHandover",
        }
    }

    /// Human-readable label stored on freshly materialised stage records.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TeamAcceptance => "Team acceptance",
            Self::ConcreteWorks => "Concrete works",
            Self::SecondPayment => "Second payment",
            Self::InstallationComplete => "Installation complete",
            Self::DeliveryHandover => "Delivery & handover",
        }
    }
}

impl FromStr for StageId {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| WorkflowError::UnknownStage(s.to_string()))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a project report in the workflow graph.
///
/// Declaration order is graph order; transitions never move backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkflowState {
    Draft,
    PendingTeamAcceptance,
    InProgress,
    ConcreteWorksDone,
    FinishingWorks,
    TechnicallyCompleted,
    Completed,
    Archived,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 8] = [
        WorkflowState::Draft,
        WorkflowState::PendingTeamAcceptance,
        WorkflowState::InProgress,
        WorkflowState::ConcreteWorksDone,
        WorkflowState::FinishingWorks,
        WorkflowState::TechnicallyCompleted,
        WorkflowState::Completed,
        WorkflowState::Archived,
    ];

    /// Initial state of a freshly created project report.
    pub const INITIAL: WorkflowState = WorkflowState::Draft;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::PendingTeamAcceptance => "PendingTeamAcceptance",
            Self::InProgress => "InProgress",
            Self::ConcreteWorksDone => "ConcreteWorksDone",
            Self::FinishingWorks => "FinishingWorks",
            Self::TechnicallyCompleted => "TechnicallyCompleted",
            Self::Completed => "Completed",
            Self::Archived => "Archived",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived)
    }

    /// True when moving to `target` does not go backwards in the graph.
    pub fn is_forward_or_same(&self, target: WorkflowState) -> bool {
        target >= *self
    }
}

impl FromStr for WorkflowState {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| WorkflowError::InvalidInput(format!("unknown workflow state: {s}")))
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
