//! Workflow State Machine
//!
//! The project transition table and the pure functions that apply a
//! transition to a report: precondition checks against the current state,
//! stage-record lookup by key, evidence merging and the state change itself.
//! Nothing here performs I/O; the engine runs these under the report lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::content::ProjectContent;
use crate::error::WorkflowError;
use crate::guard::Relation;
use crate::stage::{StageId, WorkflowState};
use crate::types::{Attachment, Report, ReportStatus, StageRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransitionKind {
    AssignTeam,
    AcceptTeam,
    ConfirmConcrete,
    ConfirmSecondPayment,
    ConfirmTechnicalCompletion,
    CompleteProject,
    FinalizeHandover,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssignTeam => "assignTeam",
            Self::AcceptTeam => "acceptTeam",
            Self::ConfirmConcrete => "confirmConcrete",
            Self::ConfirmSecondPayment => "confirmSecondPayment",
            Self::ConfirmTechnicalCompletion => "confirmTechnicalCompletion",
            Self::CompleteProject => "completeProject",
            Self::FinalizeHandover => "finalizeHandover",
        }
    }

    pub fn rule(&self) -> &'static TransitionRule {
        match self {
            Self::AssignTeam => &ASSIGN_TEAM,
            Self::AcceptTeam => &ACCEPT_TEAM,
            Self::ConfirmConcrete => &CONFIRM_CONCRETE,
            Self::ConfirmSecondPayment => &CONFIRM_SECOND_PAYMENT,
            Self::ConfirmTechnicalCompletion => &CONFIRM_TECHNICAL_COMPLETION,
            Self::CompleteProject => &COMPLETE_PROJECT,
            Self::FinalizeHandover => &FINALIZE_HANDOVER,
        }
    }

    /// Transition a stage key dispatches to, given the report's current state
    /// and how the caller relates to the report.
    ///
    /// `deliveryHandover` is shared by two transitions. Once the report is
    /// `Completed` it always finalizes; before that, an owner who is not also
    /// the assigned team lead is asking to finalize too, so the request fails
    /// on its state rather than on the team lead's transition.
    pub fn for_stage(
        stage: StageId,
        state: Option<WorkflowState>,
        relations: &[Relation],
    ) -> Self {
        match stage {
            StageId::TeamAcceptance => Self::AcceptTeam,
            StageId::ConcreteWorks => Self::ConfirmConcrete,
            StageId::SecondPayment => Self::ConfirmSecondPayment,
            StageId::InstallationComplete => Self::ConfirmTechnicalCompletion,
            StageId::DeliveryHandover => {
                let owner_only = relations.contains(&Relation::Owner)
                    && !relations.contains(&Relation::AssignedTeamLead);
                if state == Some(WorkflowState::Completed) || owner_only {
                    Self::FinalizeHandover
                } else {
                    Self::CompleteProject
                }
            }
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the transition table.
#[derive(Debug)]
pub struct TransitionRule {
    pub kind: TransitionKind,
    pub from: &'static [WorkflowState],
    pub stage: Option<StageId>,
    /// Any one of these relations to the report admits the caller.
    pub actors: &'static [Relation],
    pub to: WorkflowState,
    /// Also moves the coarse report status to `Approved`.
    pub approves_report: bool,
}

const ASSIGN_TEAM: TransitionRule = TransitionRule {
    kind: TransitionKind::AssignTeam,
    from: &[WorkflowState::Draft, WorkflowState::PendingTeamAcceptance],
    stage: None,
    actors: &[Relation::Owner, Relation::Administrator],
    to: WorkflowState::PendingTeamAcceptance,
    approves_report: false,
};

const ACCEPT_TEAM: TransitionRule = TransitionRule {
    kind: TransitionKind::AcceptTeam,
    from: &[WorkflowState::PendingTeamAcceptance],
    stage: Some(StageId::TeamAcceptance),
    actors: &[Relation::AssignedTeamLead],
    to: WorkflowState::InProgress,
    approves_report: false,
};

const CONFIRM_CONCRETE: TransitionRule = TransitionRule {
    kind: TransitionKind::ConfirmConcrete,
    from: &[WorkflowState::InProgress],
    stage: Some(StageId::ConcreteWorks),
    actors: &[Relation::AssignedTeamLead],
    to: WorkflowState::ConcreteWorksDone,
    approves_report: false,
};

const CONFIRM_SECOND_PAYMENT: TransitionRule = TransitionRule {
    kind: TransitionKind::ConfirmSecondPayment,
    from: &[WorkflowState::ConcreteWorksDone],
    stage: Some(StageId::SecondPayment),
    actors: &[Relation::Owner],
    to: WorkflowState::FinishingWorks,
    approves_report: false,
};

const CONFIRM_TECHNICAL_COMPLETION: TransitionRule = TransitionRule {
    kind: TransitionKind::ConfirmTechnicalCompletion,
    from: &[WorkflowState::FinishingWorks],
    stage: Some(StageId::InstallationComplete),
    actors: &[Relation::AssignedTeamLead],
    to: WorkflowState::TechnicallyCompleted,
    approves_report: false,
};

const COMPLETE_PROJECT: TransitionRule = TransitionRule {
    kind: TransitionKind::CompleteProject,
    from: &[
        WorkflowState::FinishingWorks,
        WorkflowState::TechnicallyCompleted,
    ],
    stage: Some(StageId::DeliveryHandover),
    actors: &[Relation::AssignedTeamLead],
    to: WorkflowState::Completed,
    approves_report: false,
};

const FINALIZE_HANDOVER: TransitionRule = TransitionRule {
    kind: TransitionKind::FinalizeHandover,
    from: &[WorkflowState::Completed],
    stage: Some(StageId::DeliveryHandover),
    actors: &[Relation::Owner],
    to: WorkflowState::Archived,
    approves_report: true,
};

/// The whole table, in graph order.
pub const TRANSITIONS: [&TransitionRule; 7] = [
    &ASSIGN_TEAM,
    &ACCEPT_TEAM,
    &CONFIRM_CONCRETE,
    &CONFIRM_SECOND_PAYMENT,
    &CONFIRM_TECHNICAL_COMPLETION,
    &COMPLETE_PROJECT,
    &FINALIZE_HANDOVER,
];

/// How a transition request was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Current state is a declared predecessor; the state advances.
    Advance,
    /// Stage already confirmed and report already in the target state;
    /// evidence is merged, the state stays put.
    Reconfirm,
}

/// Fields merged into a stage record.
#[derive(Debug, Clone, Default)]
pub struct StageUpdate {
    pub completed: bool,
    pub comment: Option<String>,
    pub files: Vec<Attachment>,
}

/// Check the state precondition of `rule` against `report`.
pub fn admit(
    rule: &TransitionRule,
    report: &Report,
    allow_reconfirmation: bool,
) -> Result<Admission, WorkflowError> {
    let state = report.workflow_status;
    let failed = || WorkflowError::precondition(rule.kind, rule.from, state);

    let project = report.content.as_project().ok_or_else(failed)?;
    let Some(current) = state else {
        return Err(failed());
    };

    if rule.from.contains(&current) {
        return Ok(Admission::Advance);
    }

    let stage_confirmed = rule
        .stage
        .and_then(|stage| find_stage(&project.updates, stage))
        .map(|record| record.completed)
        .unwrap_or(false);

    if allow_reconfirmation && current == rule.to && !current.is_terminal() && stage_confirmed {
        return Ok(Admission::Reconfirm);
    }

    Err(failed())
}

/// Apply an admitted transition. The caller has already passed the access guard.
pub fn apply(
    rule: &TransitionRule,
    report: &mut Report,
    update: StageUpdate,
    allow_reconfirmation: bool,
    now: DateTime<Utc>,
) -> Result<Admission, WorkflowError> {
    let admission = admit(rule, report, allow_reconfirmation)?;

    if let Some(stage) = rule.stage {
        let project = report
            .content
            .as_project_mut()
            .ok_or_else(|| WorkflowError::precondition(rule.kind, rule.from, None))?;
        upsert_stage(&mut project.updates, stage, update, now);
    }

    if admission == Admission::Advance {
        report.workflow_status = Some(rule.to);
        if rule.approves_report {
            report.status = ReportStatus::Approved;
        }
    }
    report.last_modified = now;
    Ok(admission)
}

pub fn find_stage(updates: &[StageRecord], stage: StageId) -> Option<&StageRecord> {
    updates.iter().find(|record| record.is(stage))
}

/// Merge `update` into the record keyed by `stage`, appending a new record
/// when the stage has not been materialised yet. Files are always appended.
pub fn upsert_stage(
    updates: &mut Vec<StageRecord>,
    stage: StageId,
    update: StageUpdate,
    now: DateTime<Utc>,
) -> &StageRecord {
    let index = match updates.iter().position(|record| record.is(stage)) {
        Some(index) => index,
        None => {
            updates.push(StageRecord::pending(stage));
            updates.len() - 1
        }
    };

    let record = &mut updates[index];
    if update.completed {
        record.completed = true;
        record.timestamp = Some(now);
    }
    if update.comment.is_some() {
        record.comment = update.comment;
    }
    record.files.extend(update.files);
    &updates[index]
}

/// Compatibility shim: files uploaded without a stage id go to the last
/// stage record. Older clients depend on this placement.
pub fn attach_to_last_stage(
    project: &mut ProjectContent,
    files: Vec<Attachment>,
) -> Result<&StageRecord, WorkflowError> {
    let record = project.updates.last_mut().ok_or_else(|| {
        WorkflowError::InvalidInput("report has no stage record to attach files to".into())
    })?;
    record.files.extend(files);
    Ok(&*record)
}
