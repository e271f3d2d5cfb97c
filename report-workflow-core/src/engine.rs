//! Report Workflow Engine
//!
//! Transport-agnostic operations over report aggregates. Every operation
//! resolves its caller, asks the access guard, checks the workflow state,
//! performs uploads outside the report lock and then re-checks and applies
//! the change inside one repository mutation. Notifications go out after the
//! mutation committed.

use chrono::Utc;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::content::{ProjectContent, ReportContent};
use crate::directory::UserDirectory;
use crate::document_store::{DocumentStore, FileUpload};
use crate::error::WorkflowError;
use crate::guard::{AccessGuard, Capability, ReportScope, Relation};
use crate::machine::{self, Admission, StageUpdate, TransitionKind};
use crate::notify::{Notification, Notifier};
use crate::repository::{mutation, Mutation, ReportRepository};
use crate::stage::{StageId, WorkflowState};
use crate::types::{
    AdminNote, Attachment, BranchId, Evaluation, ExceptionRecord, Modification, NoteReply,
    PermissionFlag, Report, ReportStatus, TeamId, UserId, UserRecord, UserRef,
};
use crate::visibility::filter_for_caller;

/// Input of `confirm_stage`.
#[derive(Debug, Clone)]
pub struct StageConfirmation {
    /// Stage key; must belong to the fixed stage vocabulary.
    pub stage_id: String,
    pub comment: Option<String>,
    pub files: Vec<FileUpload>,
}

impl StageConfirmation {
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            comment: None,
            files: Vec::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_file(mut self, file: FileUpload) -> Self {
        self.files.push(file);
        self
    }
}

/// Input of `create_report`.
#[derive(Debug, Clone)]
pub struct NewReport {
    pub branch_id: Option<BranchId>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: ReportContent,
}

impl NewReport {
    pub fn new(content: ReportContent) -> Self {
        Self {
            branch_id: None,
            title: None,
            description: None,
            content,
        }
    }
}

/// Plain field edits. `None` leaves a field as stored.
#[derive(Debug, Clone, Default)]
pub struct ReportEdit {
    pub title: Option<String>,
    pub description: Option<String>,
    pub branch_id: Option<BranchId>,
    /// Replacement payload for non-project reports.
    pub content: Option<ReportContent>,
    /// Version the client last read; a mismatch is a conflict.
    pub expected_version: Option<i64>,
}

pub struct ReportWorkflowEngine {
    reports: Arc<dyn ReportRepository>,
    directory: Arc<dyn UserDirectory>,
    documents: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl ReportWorkflowEngine {
    pub fn new(
        reports: Arc<dyn ReportRepository>,
        directory: Arc<dyn UserDirectory>,
        documents: Arc<dyn DocumentStore>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            reports,
            directory,
            documents,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─── Creation ─────────────────────────────────────────────

    #[instrument(skip(self, caller, draft), fields(report_type = %draft.content.report_type()))]
    pub async fn create_report(
        &self,
        caller: Option<&UserRef>,
        draft: NewReport,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        AccessGuard::require_submit(&user, draft.content.report_type())?;

        let mut report = Report::new(user.id, draft.branch_id, draft.content);
        report.title = draft.title;
        report.description = draft.description;
        let created_at = report.created_at;
        if let Some(project) = report.content.as_project_mut() {
            project.normalize(created_at);
        }

        deadline(
            "report insert",
            self.config.store_timeout(),
            self.reports.insert(&report),
        )
        .await?;

        info!(report_id = %report.id, owner = user.id, "report created");
        Ok(report)
    }

    pub async fn create_project_report(
        &self,
        caller: Option<&UserRef>,
        branch_id: Option<BranchId>,
        initial: ProjectContent,
    ) -> Result<Report, WorkflowError> {
        let draft = NewReport {
            branch_id,
            title: initial.project_name.clone(),
            description: None,
            content: ReportContent::Project(initial),
        };
        self.create_report(caller, draft).await
    }

    // ─── Workflow transitions ─────────────────────────────────

    #[instrument(skip(self, caller), fields(report_id = %report_id))]
    pub async fn assign_team(
        &self,
        report_id: Uuid,
        caller: Option<&UserRef>,
        team_id: TeamId,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let report = self.load(report_id).await?;
        let fallback = self.fallback_team(&report).await?;

        let kind = TransitionKind::AssignTeam;
        let scope = scope_of(&report, fallback);
        AccessGuard::require(&user, Capability::Transition(kind), &scope)?;
        machine::admit(kind.rule(), &report, false)?;

        let now = Utc::now();
        let updated = self
            .commit(
                report_id,
                mutation(|r: &mut Report| {
                    let scope = scope_of(r, fallback);
                    AccessGuard::require(&user, Capability::Transition(kind), &scope)?;
                    machine::apply(kind.rule(), r, StageUpdate::default(), false, now)?;
                    r.assigned_team_id = Some(team_id);
                    Ok(())
                }),
            )
            .await?;

        info!(report_id = %report_id, team_id, "team assigned");
        Ok(filter_for_caller(updated, &user))
    }

    /// Unified transition entry point: the stage key, the current state and
    /// the caller's relation to the report select the transition.
    #[instrument(
        skip(self, caller, confirmation),
        fields(report_id = %report_id, stage = %confirmation.stage_id)
    )]
    pub async fn confirm_stage(
        &self,
        report_id: Uuid,
        caller: Option<&UserRef>,
        confirmation: StageConfirmation,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let stage: StageId = confirmation.stage_id.parse()?;
        let report = self.load(report_id).await?;
        let fallback = self.fallback_team(&report).await?;
        let allow_reconfirmation = self.config.allow_reconfirmation;

        let scope = scope_of(&report, fallback);
        let relations = AccessGuard::relations(&user, &scope);
        let kind = TransitionKind::for_stage(stage, report.workflow_status, &relations);
        AccessGuard::require(&user, Capability::Transition(kind), &scope)?;
        machine::admit(kind.rule(), &report, allow_reconfirmation)?;

        let attachments = self
            .upload_all(report_id, &confirmation.files, user.id)
            .await?;
        let uploaded = attachments.clone();
        let comment = confirmation.comment;
        let now = Utc::now();

        let mut outcome: Option<(TransitionKind, Admission)> = None;
        let committed = self
            .commit(
                report_id,
                mutation(|r: &mut Report| {
                    // The state may have moved while files were uploading.
                    let scope = scope_of(r, fallback);
                    let relations = AccessGuard::relations(&user, &scope);
                    let kind = TransitionKind::for_stage(stage, r.workflow_status, &relations);
                    AccessGuard::require(&user, Capability::Transition(kind), &scope)?;
                    let update = StageUpdate {
                        completed: true,
                        comment,
                        files: attachments,
                    };
                    let admission =
                        machine::apply(kind.rule(), r, update, allow_reconfirmation, now)?;
                    outcome = Some((kind, admission));
                    Ok(())
                }),
            )
            .await;

        let updated = committed.inspect_err(|e| log_orphans(report_id, &uploaded, e))?;
        let Some((kind, admission)) = outcome else {
            return Err(WorkflowError::InvalidInput(format!(
                "stage {stage} was not applied"
            )));
        };

        info!(
            report_id = %report_id,
            transition = %kind,
            reconfirmed = admission == Admission::Reconfirm,
            files = uploaded.len(),
            state = ?updated.workflow_status,
            "stage confirmed"
        );

        if kind.rule().actors.contains(&Relation::AssignedTeamLead) && !updated.is_owned_by(&user) {
            let notification = Notification::for_report(
                updated.owner_user_id,
                report_id,
                format!("{} confirmed", stage.label()),
                format!("{} confirmed {}", display_name(&user), stage.label()),
            )
            .with_data("stageId", stage.as_str());
            let notification = match updated.workflow_status {
                Some(state) => notification.with_data("workflowStatus", state.as_str()),
                None => notification,
            };
            self.notify(notification).await;
        }

        Ok(filter_for_caller(updated, &user))
    }

    /// Add evidence to a stage without confirming it. Without a stage id the
    /// files go to the last stage record when the compatibility shim is on.
    #[instrument(skip(self, caller, files), fields(report_id = %report_id, stage = ?stage_id))]
    pub async fn attach_files(
        &self,
        report_id: Uuid,
        caller: Option<&UserRef>,
        stage_id: Option<&str>,
        files: Vec<FileUpload>,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let stage = stage_id.map(|s| s.parse::<StageId>()).transpose()?;
        if files.is_empty() {
            return Err(WorkflowError::InvalidInput("no files to attach".into()));
        }
        if stage.is_none() && !self.config.legacy_orphan_attachment {
            return Err(WorkflowError::InvalidInput(
                "a stage id is required when attaching files".into(),
            ));
        }

        let report = self.load(report_id).await?;
        let fallback = self.fallback_team(&report).await?;
        let scope = scope_of(&report, fallback);
        AccessGuard::require(&user, Capability::AttachFiles, &scope)?;
        ensure_open(&report, "attachFiles")?;

        let attachments = self.upload_all(report_id, &files, user.id).await?;
        let uploaded = attachments.clone();
        let now = Utc::now();

        let committed = self
            .commit(
                report_id,
                mutation(|r: &mut Report| {
                    let scope = scope_of(r, fallback);
                    AccessGuard::require(&user, Capability::AttachFiles, &scope)?;
                    ensure_open(r, "attachFiles")?;
                    let project = r.content.as_project_mut().ok_or_else(|| {
                        WorkflowError::InvalidInput("not a project report".into())
                    })?;
                    match stage {
                        Some(stage) => {
                            let update = StageUpdate {
                                completed: false,
                                comment: None,
                                files: attachments,
                            };
                            machine::upsert_stage(&mut project.updates, stage, update, now);
                        }
                        None => {
                            let record = machine::attach_to_last_stage(project, attachments)?;
                            warn!(
                                report_id = %report_id,
                                stage = %record.id,
                                "files without stage id attached to last stage record"
                            );
                        }
                    }
                    r.last_modified = now;
                    Ok(())
                }),
            )
            .await;

        let updated = committed.inspect_err(|e| log_orphans(report_id, &uploaded, e))?;
        info!(report_id = %report_id, files = uploaded.len(), "files attached");
        Ok(filter_for_caller(updated, &user))
    }

    #[instrument(skip(self, caller, comment, files), fields(report_id = %report_id))]
    pub async fn add_exception(
        &self,
        report_id: Uuid,
        caller: Option<&UserRef>,
        comment: String,
        files: Vec<FileUpload>,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let comment = comment.trim().to_string();
        if comment.is_empty() {
            return Err(WorkflowError::InvalidInput("exception comment is empty".into()));
        }

        let report = self.load(report_id).await?;
        let fallback = self.fallback_team(&report).await?;
        let scope = scope_of(&report, fallback);
        AccessGuard::require(&user, Capability::RecordException, &scope)?;
        ensure_open(&report, "addException")?;

        let attachments = self.upload_all(report_id, &files, user.id).await?;
        let uploaded = attachments.clone();
        let now = Utc::now();

        let committed = self
            .commit(
                report_id,
                mutation(|r: &mut Report| {
                    let scope = scope_of(r, fallback);
                    AccessGuard::require(&user, Capability::RecordException, &scope)?;
                    ensure_open(r, "addException")?;
                    let project = r.content.as_project_mut().ok_or_else(|| {
                        WorkflowError::InvalidInput("not a project report".into())
                    })?;
                    project.exceptions.push(ExceptionRecord {
                        id: Uuid::new_v4().to_string(),
                        comment,
                        files: attachments,
                        timestamp: now,
                        uploaded_by: UserRef::Id(user.id),
                    });
                    r.last_modified = now;
                    Ok(())
                }),
            )
            .await;

        let updated = committed.inspect_err(|e| log_orphans(report_id, &uploaded, e))?;
        info!(report_id = %report_id, "exception recorded");

        if !updated.is_owned_by(&user) {
            self.notify(Notification::for_report(
                updated.owner_user_id,
                report_id,
                "Exception reported",
                format!("{} reported an exception", display_name(&user)),
            ))
            .await;
        }
        Ok(filter_for_caller(updated, &user))
    }

    // ─── Administration ───────────────────────────────────────

    #[instrument(skip(self, caller, content), fields(report_id = %report_id))]
    pub async fn add_admin_note(
        &self,
        report_id: Uuid,
        caller: Option<&UserRef>,
        content: String,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let content = non_empty(content, "note")?;
        let report = self.load(report_id).await?;
        AccessGuard::require(&user, Capability::Administer, &scope_of(&report, None))?;

        let note_id = Uuid::new_v4().to_string();
        let note = AdminNote {
            id: note_id.clone(),
            author_id: UserRef::Id(user.id),
            author_name: display_name(&user).to_string(),
            content,
            timestamp: Utc::now(),
            replies: Vec::new(),
            read_by: vec![UserRef::Id(user.id)],
        };

        let updated = self
            .commit(
                report_id,
                mutation(|r: &mut Report| {
                    AccessGuard::require(&user, Capability::Administer, &scope_of(r, None))?;
                    r.last_modified = note.timestamp;
                    r.content.admin_notes_mut().push(note);
                    Ok(())
                }),
            )
            .await?;

        info!(report_id = %report_id, note_id = %note_id, "admin note added");
        if !updated.is_owned_by(&user) {
            self.notify(
                Notification::for_report(
                    updated.owner_user_id,
                    report_id,
                    "New admin note",
                    format!("{} left a note on your report", display_name(&user)),
                )
                .with_data("noteId", note_id),
            )
            .await;
        }
        Ok(filter_for_caller(updated, &user))
    }

    #[instrument(skip(self, caller, content), fields(report_id = %report_id, note_id = %note_id))]
    pub async fn reply_to_note(
        &self,
        report_id: Uuid,
        note_id: &str,
        caller: Option<&UserRef>,
        content: String,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let content = non_empty(content, "reply")?;
        let report = self.load(report_id).await?;
        AccessGuard::require(&user, Capability::Administer, &scope_of(&report, None))?;

        let reply = NoteReply {
            id: Uuid::new_v4().to_string(),
            author_id: UserRef::Id(user.id),
            author_name: display_name(&user).to_string(),
            content,
            timestamp: Utc::now(),
        };

        let mut note_author: Option<UserRef> = None;
        let updated = self
            .commit(
                report_id,
                mutation(|r: &mut Report| {
                    AccessGuard::require(&user, Capability::Administer, &scope_of(r, None))?;
                    r.last_modified = reply.timestamp;
                    let note = r
                        .content
                        .admin_notes_mut()
                        .iter_mut()
                        .find(|note| note.id == note_id)
                        .ok_or_else(|| WorkflowError::NotFound(format!("admin note {note_id}")))?;
                    note_author = Some(note.author_id.clone());
                    note.replies.push(reply);
                    Ok(())
                }),
            )
            .await?;

        info!(report_id = %report_id, note_id = %note_id, "note reply added");
        let author = match note_author.filter(|author| !author.refers_to(&user)) {
            Some(author) => self.note_author_id(&author).await,
            None => None,
        };
        if let Some(author) = author {
            self.notify(
                Notification::for_report(
                    author,
                    report_id,
                    "New reply to your note",
                    format!("{} replied to your note", display_name(&user)),
                )
                .with_data("noteId", note_id),
            )
            .await;
        }
        Ok(filter_for_caller(updated, &user))
    }

    #[instrument(skip(self, caller), fields(report_id = %report_id))]
    pub async fn mark_notes_read(
        &self,
        report_id: Uuid,
        caller: Option<&UserRef>,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let report = self.load(report_id).await?;
        AccessGuard::require(&user, Capability::MarkNotesRead, &scope_of(&report, None))?;

        let unread = |r: &Report| {
            r.content
                .admin_notes()
                .iter()
                .any(|note| !note.is_read_by(&user))
        };
        if !unread(&report) {
            return Ok(filter_for_caller(report, &user));
        }

        let updated = self
            .commit(
                report_id,
                mutation(|r: &mut Report| {
                    for note in r.content.admin_notes_mut().iter_mut() {
                        if !note.is_read_by(&user) {
                            note.read_by.push(UserRef::Id(user.id));
                        }
                    }
                    Ok(())
                }),
            )
            .await?;

        debug!(report_id = %report_id, user_id = user.id, "notes marked read");
        Ok(filter_for_caller(updated, &user))
    }

    #[instrument(skip(self, caller, comment), fields(report_id = %report_id, status = %status))]
    pub async fn evaluate_report(
        &self,
        report_id: Uuid,
        caller: Option<&UserRef>,
        status: ReportStatus,
        rating: Option<u8>,
        comment: Option<String>,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        if let Some(rating) = rating.filter(|r| !(1..=5).contains(r)) {
            return Err(WorkflowError::InvalidInput(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }
        let report = self.load(report_id).await?;
        AccessGuard::require(&user, Capability::Administer, &scope_of(&report, None))?;

        let evaluation = Evaluation {
            status,
            rating,
            comment,
            evaluated_by: user.id,
            evaluated_at: Utc::now(),
        };

        let updated = self
            .commit(
                report_id,
                mutation(|r: &mut Report| {
                    AccessGuard::require(&user, Capability::Administer, &scope_of(r, None))?;
                    r.status = evaluation.status;
                    r.last_modified = evaluation.evaluated_at;
                    r.evaluation = Some(evaluation);
                    Ok(())
                }),
            )
            .await?;

        info!(report_id = %report_id, status = %status, "report evaluated");
        if !updated.is_owned_by(&user) {
            self.notify(Notification::for_report(
                updated.owner_user_id,
                report_id,
                "Report evaluated",
                format!("Your report was marked {status}"),
            ))
            .await;
        }
        Ok(filter_for_caller(updated, &user))
    }

    /// Plain field edits through a version compare-and-swap. Project
    /// workflow content only changes through the workflow operations.
    #[instrument(skip(self, caller, edit), fields(report_id = %report_id))]
    pub async fn update_report(
        &self,
        report_id: Uuid,
        caller: Option<&UserRef>,
        edit: ReportEdit,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let report = self.load(report_id).await?;
        AccessGuard::require(&user, Capability::Edit, &scope_of(&report, None))?;

        let read_version = report.version;
        if let Some(expected) = edit.expected_version.filter(|v| *v != read_version) {
            return Err(WorkflowError::Conflict(format!(
                "report {report_id} is at version {read_version}, edit was based on {expected}"
            )));
        }

        let mut next = report;
        let mut fields = Vec::new();
        if let Some(mut content) = edit.content {
            if next.content.as_project().is_some() {
                return Err(WorkflowError::InvalidInput(
                    "project content changes through workflow operations".into(),
                ));
            }
            if content.report_type() != next.report_type() {
                return Err(WorkflowError::InvalidInput(format!(
                    "report type is {} and cannot change",
                    next.report_type()
                )));
            }
            *content.admin_notes_mut() = next.content.admin_notes().to_vec();
            if content != next.content {
                fields.push("details");
            }
            next.content = content;
        }
        if let Some(title) = edit.title.filter(|title| next.title.as_ref() != Some(title)) {
            next.title = Some(title);
            fields.push("title");
        }
        if let Some(description) = edit
            .description
            .filter(|description| next.description.as_ref() != Some(description))
        {
            next.description = Some(description);
            fields.push("description");
        }
        if let Some(branch_id) = edit.branch_id.filter(|id| next.branch_id != Some(*id)) {
            next.branch_id = Some(branch_id);
            fields.push("branchId");
        }
        next.touch();
        next.modifications.push(Modification {
            modified_by: user.id,
            modified_at: next.last_modified,
            fields: fields.into_iter().map(String::from).collect(),
            version: read_version + 1,
        });

        let stored = deadline(
            "report update",
            self.config.store_timeout(),
            self.reports.update_if_version(&next, read_version),
        )
        .await?;
        if !stored {
            return Err(WorkflowError::Conflict(format!(
                "report {report_id} changed since version {read_version}"
            )));
        }
        next.version = read_version + 1;

        info!(report_id = %report_id, version = next.version, "report updated");
        Ok(filter_for_caller(next, &user))
    }

    // ─── Reads and deletion ───────────────────────────────────

    /// All reports, newest first, each filtered for the caller.
    #[instrument(skip(self, caller))]
    pub async fn list_reports(
        &self,
        caller: Option<&UserRef>,
    ) -> Result<Vec<Report>, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let reports = deadline(
            "report list",
            self.config.store_timeout(),
            self.reports.list(),
        )
        .await?;

        let visible: Vec<Report> = reports
            .into_iter()
            .filter(|report| {
                AccessGuard::require(&user, Capability::View, &scope_of(report, None)).is_ok()
            })
            .map(|report| filter_for_caller(report, &user))
            .collect();
        debug!(user_id = user.id, count = visible.len(), "reports listed");
        Ok(visible)
    }

    /// Fetch a report, filtered for the caller.
    #[instrument(skip(self, caller), fields(report_id = %report_id))]
    pub async fn get_report(
        &self,
        report_id: Uuid,
        caller: Option<&UserRef>,
    ) -> Result<Report, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let report = self.load(report_id).await?;
        AccessGuard::require(&user, Capability::View, &scope_of(&report, None))?;
        Ok(filter_for_caller(report, &user))
    }

    #[instrument(skip(self, caller), fields(report_id = %report_id))]
    pub async fn delete_report(
        &self,
        report_id: Uuid,
        caller: Option<&UserRef>,
    ) -> Result<(), WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        let report = self.load(report_id).await?;
        AccessGuard::require(&user, Capability::Delete, &scope_of(&report, None))?;

        let deleted = deadline(
            "report delete",
            self.config.store_timeout(),
            self.reports.delete(report_id),
        )
        .await?;
        if !deleted {
            return Err(WorkflowError::ReportNotFound(report_id));
        }
        info!(report_id = %report_id, deleted_by = user.id, "report deleted");
        Ok(())
    }

    /// Gate for flag-protected sub-APIs; returns the resolved caller.
    pub async fn require_permission(
        &self,
        caller: Option<&UserRef>,
        flag: PermissionFlag,
    ) -> Result<UserRecord, WorkflowError> {
        let user = self.resolve_caller(caller).await?;
        AccessGuard::require_permission(&user, flag)?;
        Ok(user)
    }

    // ─── Collaborator plumbing ────────────────────────────────

    async fn resolve_caller(&self, caller: Option<&UserRef>) -> Result<UserRecord, WorkflowError> {
        let reference = AccessGuard::identify(caller)?;
        deadline(
            "user lookup",
            self.config.store_timeout(),
            self.directory.lookup_user(reference),
        )
        .await?
        .ok_or_else(|| WorkflowError::NotFound(format!("user {reference}")))
    }

    async fn load(&self, report_id: Uuid) -> Result<Report, WorkflowError> {
        deadline(
            "report load",
            self.config.store_timeout(),
            self.reports.load(report_id),
        )
        .await?
        .ok_or(WorkflowError::ReportNotFound(report_id))
    }

    /// Team from the directory, consulted only when the report names none.
    async fn fallback_team(&self, report: &Report) -> Result<Option<TeamId>, WorkflowError> {
        if report.assigned_team_id.is_some() {
            return Ok(None);
        }
        deadline(
            "team lookup",
            self.config.store_timeout(),
            self.directory.lookup_team_for_report(report.id),
        )
        .await
    }

    /// Numeric id of a note author. Older notes name their author by
    /// username; those go through the directory, and a failed lookup only
    /// costs the notification.
    async fn note_author_id(&self, author: &UserRef) -> Option<UserId> {
        if let UserRef::Id(id) = author {
            return Some(*id);
        }
        let lookup = deadline(
            "user lookup",
            self.config.store_timeout(),
            self.directory.lookup_user(author),
        )
        .await;
        match lookup {
            Ok(Some(record)) => Some(record.id),
            Ok(None) => {
                warn!(author = %author, "note author is not in the directory");
                None
            }
            Err(e) => {
                warn!(author = %author, error = %e, "note author lookup failed");
                None
            }
        }
    }

    async fn commit<'a>(
        &self,
        report_id: Uuid,
        mutation: Mutation<'a>,
    ) -> Result<Report, WorkflowError> {
        deadline(
            "report update",
            self.config.store_timeout(),
            self.reports.mutate(report_id, mutation),
        )
        .await
    }

    /// Upload all files in parallel, each under the upload deadline. If any
    /// upload fails, the ones that succeeded are logged as orphaned and the
    /// first failure is returned.
    async fn upload_all(
        &self,
        report_id: Uuid,
        files: &[FileUpload],
        uploader: UserId,
    ) -> Result<Vec<Attachment>, WorkflowError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let limit = self.config.upload_timeout();
        let folder = self.config.upload_folder.as_str();
        let uploads = files.iter().map(move |file| async move {
            match tokio::time::timeout(limit, self.documents.upload(file, folder)).await {
                Ok(Ok(stored)) => Ok(stored),
                Ok(Err(e)) => Err(WorkflowError::StoreUnavailable(format!(
                    "upload of {} failed: {e}",
                    file.file_name
                ))),
                Err(_) => Err(WorkflowError::Timeout {
                    operation: format!("upload of {}", file.file_name),
                    after_ms: millis(limit),
                }),
            }
        });

        let mut attachments = Vec::with_capacity(files.len());
        let mut first_error = None;
        for result in join_all(uploads).await {
            match result {
                Ok(stored) => attachments.push(Attachment {
                    id: stored.id,
                    url: stored.url,
                    file_name: stored.file_name,
                    uploaded_by: Some(UserRef::Id(uploader)),
                }),
                Err(e) => {
                    warn!(report_id = %report_id, error = %e, "upload failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => {
                log_orphans(report_id, &attachments, &e);
                Err(e)
            }
            None => Ok(attachments),
        }
    }

    async fn notify(&self, notification: Notification) {
        let limit = self.config.notify_timeout();
        match tokio::time::timeout(limit, self.notifier.notify(&notification)).await {
            Ok(Ok(())) => debug!(
                user_id = notification.user_id,
                title = %notification.title,
                "notification delivered"
            ),
            Ok(Err(e)) => warn!(
                user_id = notification.user_id,
                error = %e,
                "notification failed"
            ),
            Err(_) => warn!(
                user_id = notification.user_id,
                timeout_ms = millis(limit),
                "notification timed out"
            ),
        }
    }
}

fn scope_of(report: &Report, fallback_team: Option<TeamId>) -> ReportScope {
    ReportScope {
        owner_user_id: report.owner_user_id,
        team_id: report.assigned_team_id.or(fallback_team),
    }
}

/// Exceptions and loose attachments need a project that is not archived.
fn ensure_open(report: &Report, operation: &str) -> Result<(), WorkflowError> {
    match report.workflow_status {
        Some(state) if report.content.as_project().is_some() && !state.is_terminal() => Ok(()),
        actual => {
            let open: Vec<WorkflowState> = WorkflowState::ALL
                .iter()
                .copied()
                .filter(|state| !state.is_terminal())
                .collect();
            Err(WorkflowError::precondition(operation, &open, actual))
        }
    }
}

fn non_empty(text: String, what: &str) -> Result<String, WorkflowError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(WorkflowError::InvalidInput(format!("{what} is empty")))
    } else {
        Ok(trimmed.to_string())
    }
}

fn display_name(user: &UserRecord) -> &str {
    if user.full_name.trim().is_empty() {
        &user.username
    } else {
        &user.full_name
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn log_orphans(report_id: Uuid, attachments: &[Attachment], cause: &WorkflowError) {
    for attachment in attachments {
        warn!(
            report_id = %report_id,
            url = %attachment.url,
            file_name = %attachment.file_name,
            error = %cause,
            "orphaned upload, needs manual reconciliation"
        );
    }
}

async fn deadline<T, F>(operation: &str, limit: Duration, call: F) -> Result<T, WorkflowError>
where
    F: Future<Output = Result<T, WorkflowError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(WorkflowError::Timeout {
            operation: operation.to_string(),
            after_ms: millis(limit),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_maps_expiry_to_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, WorkflowError>(())
        };
        let err = deadline("report load", Duration::from_millis(50), slow)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 504);
        assert_eq!(err.to_string(), "report load timed out after 50ms");
    }

    #[tokio::test]
    async fn deadline_passes_results_through() {
        let ok = async { Ok::<_, WorkflowError>(7) };
        assert_eq!(deadline("x", Duration::from_secs(1), ok).await.unwrap(), 7);

        let err = deadline("x", Duration::from_secs(1), async {
            Err::<(), _>(WorkflowError::Conflict("stale".into()))
        })
        .await;
        assert!(matches!(err, Err(WorkflowError::Conflict(_))));
    }

    #[test]
    fn archived_reports_are_closed() {
        let project = ReportContent::empty(crate::types::ReportType::Project);
        let mut report = Report::new(1, None, project);
        assert!(ensure_open(&report, "addException").is_ok());

        report.workflow_status = Some(WorkflowState::Archived);
        let err = ensure_open(&report, "addException").unwrap_err();
        assert!(err.to_string().ends_with("report is Archived"));

        let sales = ReportContent::empty(crate::types::ReportType::Sales);
        let sales = Report::new(1, None, sales);
        assert!(ensure_open(&sales, "attachFiles").is_err());
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let mut user = UserRecord {
            id: 1,
            username: "jdoe".into(),
            full_name: "  ".into(),
            role: crate::types::Role::Employee,
            assigned_team_id: None,
            permissions: Default::default(),
            allowed_report_types: None,
        };
        assert_eq!(display_name(&user), "jdoe");
        user.full_name = "Jane Doe".into();
        assert_eq!(display_name(&user), "Jane Doe");
    }
}
