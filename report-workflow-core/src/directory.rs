//! User/Role Directory
//!
//! Resolves callers to their role, team and permission flags. The engine only
//! reads from the directory; user management lives elsewhere.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::types::{ReportType, TeamId, UserId, UserRecord, UserRef};

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Find a user by numeric id or username.
    async fn lookup_user(&self, user: &UserRef) -> Result<Option<UserRecord>, WorkflowError>;

    /// Team responsible for a report when the report row itself has none.
    async fn lookup_team_for_report(&self, report_id: Uuid)
        -> Result<Option<TeamId>, WorkflowError>;
}

/// In-memory directory (for tests and local runs)
#[derive(Default)]
pub struct MemoryDirectory {
    users: RwLock<HashMap<UserId, UserRecord>>,
    report_teams: RwLock<HashMap<Uuid, TeamId>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: UserRecord) -> Self {
        self.users.get_mut().insert(user.id, user);
        self
    }

    pub async fn insert_user(&self, user: UserRecord) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn assign_report_team(&self, report_id: Uuid, team_id: TeamId) {
        self.report_teams.write().await.insert(report_id, team_id);
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn lookup_user(&self, user: &UserRef) -> Result<Option<UserRecord>, WorkflowError> {
        let users = self.users.read().await;
        Ok(match user {
            UserRef::Id(id) => users.get(id).cloned(),
            UserRef::Username(name) => users.values().find(|u| &u.username == name).cloned(),
        })
    }

    async fn lookup_team_for_report(
        &self,
        report_id: Uuid,
    ) -> Result<Option<TeamId>, WorkflowError> {
        Ok(self.report_teams.read().await.get(&report_id).copied())
    }
}

/// Parse the `allowed_report_types` column: a JSON array or a comma list.
/// Unknown names are ignored; an empty or absent value allows every type.
pub fn parse_allowed_report_types(raw: Option<&str>) -> Option<Vec<ReportType>> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;
    let names: Vec<String> = serde_json::from_str(raw)
        .unwrap_or_else(|_| raw.split(',').map(|s| s.trim().to_string()).collect());
    let types: Vec<ReportType> = names.iter().filter_map(|n| n.parse().ok()).collect();
    if types.is_empty() {
        None
    } else {
        Some(types)
    }
}

#[cfg(feature = "database")]
pub mod postgres {
    //! Directory backed by the `users` table.

    use async_trait::async_trait;
    use sqlx::{PgPool, Row};
    use uuid::Uuid;

    use super::{parse_allowed_report_types, UserDirectory};
    use crate::error::WorkflowError;
    use crate::types::{PermissionFlags, Role, TeamId, UserRecord, UserRef};

    const USER_COLUMNS: &str = r#"
        id, username, full_name, role, team_id,
        has_purchase_management_permission,
        has_package_management_permission,
        has_import_export_permission,
        allowed_report_types
    "#;

    pub struct PgUserDirectory {
        pool: PgPool,
    }

    impl PgUserDirectory {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl UserDirectory for PgUserDirectory {
        async fn lookup_user(&self, user: &UserRef) -> Result<Option<UserRecord>, WorkflowError> {
            let row = match user {
                UserRef::Id(id) => {
                    sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?
                }
                UserRef::Username(name) => {
                    sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1"))
                        .bind(name)
                        .fetch_optional(&self.pool)
                        .await?
                }
            };

            let Some(row) = row else {
                return Ok(None);
            };

            let role: String = row.try_get("role")?;
            let allowed: Option<String> = row.try_get("allowed_report_types")?;
            Ok(Some(UserRecord {
                id: row.try_get("id")?,
                username: row.try_get("username")?,
                full_name: row.try_get::<Option<String>, _>("full_name")?.unwrap_or_default(),
                role: Role::parse_lenient(&role),
                assigned_team_id: row.try_get("team_id")?,
                permissions: PermissionFlags {
                    purchase_management: row.try_get("has_purchase_management_permission")?,
                    package_management: row.try_get("has_package_management_permission")?,
                    import_export: row.try_get("has_import_export_permission")?,
                },
                allowed_report_types: parse_allowed_report_types(allowed.as_deref()),
            }))
        }

        async fn lookup_team_for_report(
            &self,
            report_id: Uuid,
        ) -> Result<Option<TeamId>, WorkflowError> {
            let team: Option<TeamId> = sqlx::query_scalar(
                r#"
                SELECT team_id
                FROM project_team_assignments
                WHERE report_id = $1
                ORDER BY assigned_at DESC
                LIMIT 1
                "#,
            )
            .bind(report_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(team)
        }
    }
}
