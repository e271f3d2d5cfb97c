//! Report Aggregate Repository
//!
//! Atomic load-mutate-store of the report aggregate. Workflow transitions and
//! note appends go through [`ReportRepository::mutate`], which holds a
//! per-report write lock (an in-process mutex, or `SELECT ... FOR UPDATE` in
//! Postgres) for the whole read-modify-write. Plain field edits use the
//! cheaper [`ReportRepository::update_if_version`] compare-and-swap.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::types::Report;

/// Closure applied to the locked report. Returning an error aborts the write.
pub type Mutation<'a> = Box<dyn FnOnce(&mut Report) -> Result<(), WorkflowError> + Send + 'a>;

pub fn mutation<'a, F>(f: F) -> Mutation<'a>
where
    F: FnOnce(&mut Report) -> Result<(), WorkflowError> + Send + 'a,
{
    Box::new(f)
}

#[async_trait]
pub trait ReportRepository: Send + Sync {
    async fn insert(&self, report: &Report) -> Result<(), WorkflowError>;

    async fn load(&self, id: Uuid) -> Result<Option<Report>, WorkflowError>;

    /// Every stored report, newest first.
    async fn list(&self) -> Result<Vec<Report>, WorkflowError>;

    /// Hard delete. Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> Result<bool, WorkflowError>;

    /// Locked read-modify-write. On success the stored version is bumped,
    /// `last_modified` refreshed and the stored report returned. Nothing is
    /// written when the mutation fails.
    async fn mutate<'a>(&self, id: Uuid, mutation: Mutation<'a>) -> Result<Report, WorkflowError>;

    /// Store `report` only if the stored version still equals
    /// `expected_version`. Returns false on a stale version.
    async fn update_if_version(
        &self,
        report: &Report,
        expected_version: i64,
    ) -> Result<bool, WorkflowError>;
}

/// In-memory repository with one async mutex per report
#[derive(Default)]
pub struct MemoryReportRepository {
    reports: RwLock<HashMap<Uuid, Arc<Mutex<Report>>>>,
}

impl MemoryReportRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: Uuid) -> Option<Arc<Mutex<Report>>> {
        self.reports.read().await.get(&id).cloned()
    }

    /// The entry may have been deleted while we waited for its lock.
    async fn still_stored(&self, id: Uuid, entry: &Arc<Mutex<Report>>) -> bool {
        self.reports
            .read()
            .await
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }
}

#[async_trait]
impl ReportRepository for MemoryReportRepository {
    async fn insert(&self, report: &Report) -> Result<(), WorkflowError> {
        let mut reports = self.reports.write().await;
        if reports.contains_key(&report.id) {
            return Err(WorkflowError::Conflict(format!(
                "report {} already exists",
                report.id
            )));
        }
        reports.insert(report.id, Arc::new(Mutex::new(report.clone())));
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Report>, WorkflowError> {
        match self.entry(id).await {
            Some(entry) => Ok(Some(entry.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Report>, WorkflowError> {
        let entries: Vec<_> = self.reports.read().await.values().cloned().collect();
        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            reports.push(entry.lock().await.clone());
        }
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reports)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, WorkflowError> {
        Ok(self.reports.write().await.remove(&id).is_some())
    }

    async fn mutate<'a>(&self, id: Uuid, mutation: Mutation<'a>) -> Result<Report, WorkflowError> {
        let entry = self
            .entry(id)
            .await
            .ok_or(WorkflowError::ReportNotFound(id))?;
        let mut stored = entry.lock().await;
        if !self.still_stored(id, &entry).await {
            return Err(WorkflowError::ReportNotFound(id));
        }

        let mut working = stored.clone();
        mutation(&mut working)?;
        working.version = stored.version + 1;
        working.touch();
        *stored = working;
        Ok(stored.clone())
    }

    async fn update_if_version(
        &self,
        report: &Report,
        expected_version: i64,
    ) -> Result<bool, WorkflowError> {
        let Some(entry) = self.entry(report.id).await else {
            return Err(WorkflowError::ReportNotFound(report.id));
        };
        let mut stored = entry.lock().await;
        if stored.version != expected_version {
            return Ok(false);
        }
        let mut next = report.clone();
        next.version = expected_version + 1;
        *stored = next;
        Ok(true)
    }
}

#[cfg(feature = "database")]
pub mod postgres {
    //! Postgres repository over the `reports` table.
    //!
    //! Runtime-checked `sqlx::query` throughout; the table comes from
    //! `migrations/0001_reports.sql`.

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use sqlx::{FromRow, PgPool};
    use tracing::{debug, warn};
    use uuid::Uuid;

    use super::{Mutation, ReportRepository};
    use crate::content::{lenient, ReportContent};
    use crate::error::WorkflowError;
    use crate::types::{Evaluation, Modification, Report, ReportStatus, ReportType};

    const REPORT_COLUMNS: &str = r#"
        id, owner_user_id, branch_id, title, description, report_type, status,
        workflow_status, assigned_team_id, details, evaluation, modifications,
        version, created_at, last_modified
    "#;

    #[derive(Debug, FromRow)]
    struct ReportRow {
        id: Uuid,
        owner_user_id: i64,
        branch_id: Option<i64>,
        title: Option<String>,
        description: Option<String>,
        report_type: String,
        status: String,
        workflow_status: Option<String>,
        assigned_team_id: Option<i64>,
        details: Option<String>,
        evaluation: Option<String>,
        modifications: Option<String>,
        version: i64,
        created_at: DateTime<Utc>,
        last_modified: DateTime<Utc>,
    }

    impl ReportRow {
        fn into_report(self) -> Result<Report, WorkflowError> {
            let report_type: ReportType = self.report_type.parse().map_err(|_| {
                WorkflowError::InvalidInput(format!(
                    "stored report {} has unknown type {:?}",
                    self.id, self.report_type
                ))
            })?;

            let status = self.status.parse().unwrap_or_else(|_| {
                warn!(report_id = %self.id, status = %self.status, "unknown stored status");
                ReportStatus::Pending
            });

            let workflow_status = self.workflow_status.as_deref().and_then(|raw| {
                raw.parse()
                    .map_err(|_| warn!(report_id = %self.id, state = raw, "unknown workflow state"))
                    .ok()
            });

            let evaluation = self.evaluation.as_deref().and_then(|raw| {
                serde_json::from_str::<Evaluation>(raw)
                    .map_err(|e| {
                        warn!(report_id = %self.id, error = %e, "dropping unreadable evaluation")
                    })
                    .ok()
            });

            let modifications: Vec<Modification> = self
                .modifications
                .map(|raw| lenient::list_from_value(Value::String(raw)))
                .unwrap_or_default();

            let content = ReportContent::decode_normalized(
                report_type,
                self.details.as_deref(),
                self.last_modified,
            );

            Ok(Report {
                id: self.id,
                owner_user_id: self.owner_user_id,
                branch_id: self.branch_id,
                title: self.title,
                description: self.description,
                status,
                workflow_status,
                assigned_team_id: self.assigned_team_id,
                evaluation,
                content,
                modifications,
                version: self.version,
                created_at: self.created_at,
                last_modified: self.last_modified,
            })
        }
    }

    fn encode_evaluation(report: &Report) -> Result<Option<String>, WorkflowError> {
        report
            .evaluation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(WorkflowError::from)
    }

    fn encode_modifications(report: &Report) -> Result<Option<String>, WorkflowError> {
        if report.modifications.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string(&report.modifications)?))
    }

    pub struct PgReportRepository {
        pool: PgPool,
    }

    impl PgReportRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl ReportRepository for PgReportRepository {
        async fn insert(&self, report: &Report) -> Result<(), WorkflowError> {
            sqlx::query(
                r#"
                INSERT INTO reports
                    (id, owner_user_id, branch_id, title, description, report_type,
                     status, workflow_status, assigned_team_id, details, evaluation,
                     modifications, version, created_at, last_modified)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(report.id)
            .bind(report.owner_user_id)
            .bind(report.branch_id)
            .bind(&report.title)
            .bind(&report.description)
            .bind(report.report_type().as_str())
            .bind(report.status.as_str())
            .bind(report.workflow_status.map(|s| s.as_str()))
            .bind(report.assigned_team_id)
            .bind(report.content.encode_details())
            .bind(encode_evaluation(report)?)
            .bind(encode_modifications(report)?)
            .bind(report.version)
            .bind(report.created_at)
            .bind(report.last_modified)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn load(&self, id: Uuid) -> Result<Option<Report>, WorkflowError> {
            let row: Option<ReportRow> =
                sqlx::query_as(&format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = $1"))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(ReportRow::into_report).transpose()
        }

        async fn list(&self) -> Result<Vec<Report>, WorkflowError> {
            let rows: Vec<ReportRow> = sqlx::query_as(&format!(
                "SELECT {REPORT_COLUMNS} FROM reports ORDER BY created_at DESC"
            ))
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(ReportRow::into_report).collect()
        }

        async fn delete(&self, id: Uuid) -> Result<bool, WorkflowError> {
            let deleted = sqlx::query("DELETE FROM reports WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(deleted.rows_affected() > 0)
        }

        async fn mutate<'a>(
            &self,
            id: Uuid,
            mutation: Mutation<'a>,
        ) -> Result<Report, WorkflowError> {
            let mut tx = self.pool.begin().await?;

            let row: Option<ReportRow> = sqlx::query_as(&format!(
                "SELECT {REPORT_COLUMNS} FROM reports WHERE id = $1 FOR UPDATE"
            ))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
            let mut report = row
                .ok_or(WorkflowError::ReportNotFound(id))?
                .into_report()?;

            // Dropping `tx` on error rolls back and releases the row lock.
            mutation(&mut report)?;
            report.version += 1;
            report.touch();

            sqlx::query(
                r#"
                UPDATE reports
                SET title = $2,
                    description = $3,
                    branch_id = $4,
                    status = $5,
                    workflow_status = $6,
                    assigned_team_id = $7,
                    details = $8,
                    evaluation = $9,
                    modifications = $10,
                    version = $11,
                    last_modified = $12
                WHERE id = $1
                "#,
            )
            .bind(report.id)
            .bind(&report.title)
            .bind(&report.description)
            .bind(report.branch_id)
            .bind(report.status.as_str())
            .bind(report.workflow_status.map(|s| s.as_str()))
            .bind(report.assigned_team_id)
            .bind(report.content.encode_details())
            .bind(encode_evaluation(&report)?)
            .bind(encode_modifications(&report)?)
            .bind(report.version)
            .bind(report.last_modified)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            debug!(report_id = %id, version = report.version, "report mutated");
            Ok(report)
        }

        async fn update_if_version(
            &self,
            report: &Report,
            expected_version: i64,
        ) -> Result<bool, WorkflowError> {
            let updated = sqlx::query(
                r#"
                UPDATE reports
                SET title = $2,
                    description = $3,
                    branch_id = $4,
                    details = $5,
                    status = $6,
                    modifications = $7,
                    version = version + 1,
                    last_modified = $8
                WHERE id = $1 AND version = $9
                "#,
            )
            .bind(report.id)
            .bind(&report.title)
            .bind(&report.description)
            .bind(report.branch_id)
            .bind(report.content.encode_details())
            .bind(report.status.as_str())
            .bind(encode_modifications(report)?)
            .bind(report.last_modified)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;
            Ok(updated.rows_affected() == 1)
        }
    }
}
