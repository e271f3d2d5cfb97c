//! Integration tests for the Postgres report repository
//!
//! These tests verify that:
//! 1. Reports round-trip through the `reports` table
//! 2. `mutate` serialises concurrent writers with a row lock
//! 3. A failed mutation rolls back and leaves the row untouched
//! 4. The version compare-and-swap rejects stale edits
//! 5. Legacy detail shapes and the edit history survive a write
//!
//! Requires: DATABASE_URL environment variable and `database` feature

#![cfg(feature = "database")]

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tokio::sync::{Barrier, OnceCell};
use uuid::Uuid;

use report_workflow_core::directory::postgres::PgUserDirectory;
use report_workflow_core::repository::mutation;
use report_workflow_core::repository::postgres::PgReportRepository;
use report_workflow_core::{
    AdminNote, Modification, Report, ReportContent, ReportRepository, ReportType,
    UserDirectory, UserRef, WorkflowError,
};

static MIGRATED: OnceCell<()> = OnceCell::const_new();

/// Helper to get test database pool
async fn get_test_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    MIGRATED
        .get_or_init(|| async {
            sqlx::raw_sql(include_str!("../migrations/0001_reports.sql"))
                .execute(&pool)
                .await
                .expect("Failed to apply migration");
        })
        .await;
    pool
}

/// Insert a throwaway owner and return its id.
async fn seed_owner(pool: &PgPool) -> i64 {
    sqlx::query_scalar(
        r#"
        INSERT INTO users (username, full_name, role, team_id, allowed_report_types)
        VALUES ($1, 'Test Owner', 'employee', 7, '["Project","Sales"]')
        RETURNING id
        "#,
    )
    .bind(format!("owner-{}", Uuid::new_v4()))
    .fetch_one(pool)
    .await
    .expect("Failed to seed user")
}

fn note(i: usize) -> AdminNote {
    AdminNote {
        id: Uuid::new_v4().to_string(),
        author_id: UserRef::Id(1),
        author_name: "Admin".into(),
        content: format!("note {i}"),
        timestamp: Utc::now(),
        replies: Vec::new(),
        read_by: Vec::new(),
    }
}

#[tokio::test]
async fn test_report_round_trip() {
    let pool = get_test_pool().await;
    let owner = seed_owner(&pool).await;
    let repo = PgReportRepository::new(pool);

    let mut report = Report::new(owner, Some(4), ReportContent::empty(ReportType::Project));
    report.title = Some("Carport array".into());
    repo.insert(&report).await.expect("insert");

    let loaded = repo.load(report.id).await.expect("load").expect("row");
    assert_eq!(loaded.title, report.title);
    assert_eq!(loaded.workflow_status, report.workflow_status);
    assert_eq!(loaded.report_type(), ReportType::Project);
    assert_eq!(loaded.version, 0);

    assert!(repo.delete(report.id).await.expect("delete"));
    assert!(repo.load(report.id).await.expect("load").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mutations_do_not_lose_appends() {
    let pool = get_test_pool().await;
    let owner = seed_owner(&pool).await;
    let repo = Arc::new(PgReportRepository::new(pool));

    let report = Report::new(owner, None, ReportContent::empty(ReportType::Project));
    repo.insert(&report).await.expect("insert");

    const WRITERS: usize = 8;
    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let repo = repo.clone();
            let barrier = barrier.clone();
            let id = report.id;
            tokio::spawn(async move {
                barrier.wait().await;
                repo.mutate(
                    id,
                    mutation(move |r: &mut Report| {
                        r.content.admin_notes_mut().push(note(i));
                        Ok(())
                    }),
                )
                .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.expect("join").expect("mutate");
    }

    let loaded = repo.load(report.id).await.expect("load").expect("row");
    assert_eq!(loaded.content.admin_notes().len(), WRITERS);
    assert_eq!(loaded.version, WRITERS as i64);
}

#[tokio::test]
async fn test_failed_mutation_rolls_back() {
    let pool = get_test_pool().await;
    let owner = seed_owner(&pool).await;
    let repo = PgReportRepository::new(pool);

    let report = Report::new(owner, None, ReportContent::empty(ReportType::Project));
    repo.insert(&report).await.expect("insert");

    let err = repo
        .mutate(
            report.id,
            mutation(|r: &mut Report| {
                r.title = Some("never stored".into());
                Err(WorkflowError::InvalidInput("reject".into()))
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidInput(_)));

    let loaded = repo.load(report.id).await.expect("load").expect("row");
    assert_eq!(loaded.title, None);
    assert_eq!(loaded.version, 0);
}

#[tokio::test]
async fn test_stale_version_rejected() {
    let pool = get_test_pool().await;
    let owner = seed_owner(&pool).await;
    let repo = PgReportRepository::new(pool);

    let mut report = Report::new(owner, None, ReportContent::empty(ReportType::Sales));
    repo.insert(&report).await.expect("insert");

    report.title = Some("first".into());
    assert!(repo.update_if_version(&report, 0).await.expect("update"));
    report.title = Some("second".into());
    assert!(!repo.update_if_version(&report, 0).await.expect("update"));

    let loaded = repo.load(report.id).await.expect("load").expect("row");
    assert_eq!(loaded.title.as_deref(), Some("first"));
}

#[tokio::test]
async fn test_double_encoded_details_are_recovered() {
    let pool = get_test_pool().await;
    let owner = seed_owner(&pool).await;

    let id = Uuid::new_v4();
    let inner = r#"{"updates":[{"id":"concreteWorks","completed":true}]}"#;
    let double_encoded = serde_json::to_string(inner).expect("encode");
    sqlx::query(
        r#"
        INSERT INTO reports (id, owner_user_id, report_type, status, workflow_status, details)
        VALUES ($1, $2, 'Project', 'Pending', 'ConcreteWorksDone', $3)
        "#,
    )
    .bind(id)
    .bind(owner)
    .bind(double_encoded)
    .execute(&pool)
    .await
    .expect("seed report");

    let repo = PgReportRepository::new(pool);
    let loaded = repo.load(id).await.expect("load").expect("row");
    let project = loaded.content.as_project().expect("project content");
    assert_eq!(project.updates.len(), 1);
    assert!(project.updates[0].completed);
    assert_eq!(project.updates[0].timestamp, Some(loaded.last_modified));
}

#[tokio::test]
async fn test_legacy_details_survive_a_mutation() {
    let pool = get_test_pool().await;
    let owner = seed_owner(&pool).await;

    let id = Uuid::new_v4();
    let details = serde_json::json!({
        "updates": [
            {"id": "concreteWorks", "completed": true,
             "timestamp": "2025-01-02 08:30:00",
             "files": ["https://bucket/slab.jpg"]}
        ],
        "adminNotes": [
            {"id": "n1", "authorId": "EMP-042", "authorName": "Ops",
             "content": "call the customer", "timestamp": "2025-01-05 09:00:00",
             "readBy": ["EMP-042"]}
        ]
    });
    sqlx::query(
        r#"
        INSERT INTO reports (id, owner_user_id, report_type, status, workflow_status, details)
        VALUES ($1, $2, 'Project', 'Pending', 'ConcreteWorksDone', $3)
        "#,
    )
    .bind(id)
    .bind(owner)
    .bind(details.to_string())
    .execute(&pool)
    .await
    .expect("seed report");

    let repo = PgReportRepository::new(pool);
    repo.mutate(
        id,
        mutation(|r: &mut Report| {
            r.content.admin_notes_mut()[0].read_by.push(UserRef::Id(90));
            Ok(())
        }),
    )
    .await
    .expect("mutate");

    let loaded = repo.load(id).await.expect("load").expect("row");
    let project = loaded.content.as_project().expect("project content");
    assert_eq!(project.updates[0].files.len(), 1);
    assert_eq!(project.updates[0].files[0].url, "https://bucket/slab.jpg");
    let note = &project.admin_notes[0];
    assert_eq!(note.author_id, UserRef::Username("EMP-042".into()));
    assert_eq!(
        note.read_by,
        vec![UserRef::Username("EMP-042".into()), UserRef::Id(90)]
    );
}

#[tokio::test]
async fn test_list_and_edit_history() {
    let pool = get_test_pool().await;
    let owner = seed_owner(&pool).await;
    let repo = PgReportRepository::new(pool);

    let mut older = Report::new(owner, None, ReportContent::empty(ReportType::Sales));
    older.created_at = Utc::now() - Duration::days(3);
    let newer = Report::new(owner, None, ReportContent::empty(ReportType::Sales));
    repo.insert(&older).await.expect("insert");
    repo.insert(&newer).await.expect("insert");

    let ids: Vec<Uuid> = repo
        .list()
        .await
        .expect("list")
        .into_iter()
        .map(|r| r.id)
        .filter(|id| *id == older.id || *id == newer.id)
        .collect();
    assert_eq!(ids, vec![newer.id, older.id]);

    older.title = Some("renamed".into());
    older.modifications.push(Modification {
        modified_by: owner,
        modified_at: Utc::now(),
        fields: vec!["title".into()],
        version: 1,
    });
    assert!(repo.update_if_version(&older, 0).await.expect("update"));

    let loaded = repo.load(older.id).await.expect("load").expect("row");
    assert_eq!(loaded.modifications.len(), 1);
    assert_eq!(loaded.modifications[0].fields, vec!["title"]);
    assert_eq!(loaded.modifications[0].modified_by, owner);
}

#[tokio::test]
async fn test_directory_lookup() {
    let pool = get_test_pool().await;
    let owner = seed_owner(&pool).await;
    let directory = PgUserDirectory::new(pool);

    let user = directory
        .lookup_user(&UserRef::Id(owner))
        .await
        .expect("lookup")
        .expect("user");
    assert_eq!(user.assigned_team_id, Some(7));
    assert_eq!(
        user.allowed_report_types,
        Some(vec![ReportType::Project, ReportType::Sales])
    );

    let by_name = directory
        .lookup_user(&UserRef::Username(user.username.clone()))
        .await
        .expect("lookup");
    assert_eq!(by_name, Some(user));
}
