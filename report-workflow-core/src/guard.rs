//! Access Guard
//!
//! Every engine operation asks the guard before touching a report. Two tiers:
//! per-user permission flags that open a whole sub-API, and relations to a
//! specific report (owner, assigned team lead, administrator) that gate
//! workflow transitions and report edits.

use serde::Serialize;
use std::fmt;

use crate::error::WorkflowError;
use crate::machine::TransitionKind;
use crate::types::{PermissionFlag, ReportType, TeamId, UserId, UserRecord, UserRef};

/// How a caller relates to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Relation {
    Owner,
    AssignedTeamLead,
    Administrator,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "report owner",
            Self::AssignedTeamLead => "assigned team lead",
            Self::Administrator => "administrator",
        }
    }
}

/// Report-scoped actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    View,
    Edit,
    Delete,
    Transition(TransitionKind),
    AttachFiles,
    RecordException,
    Administer,
    MarkNotesRead,
}

impl Capability {
    /// Relations that admit a caller; an empty set admits any identified user.
    pub fn admitted(&self) -> &'static [Relation] {
        match self {
            Self::View | Self::MarkNotesRead => &[],
            Self::Edit | Self::Delete => &[Relation::Owner, Relation::Administrator],
            Self::Transition(kind) => kind.rule().actors,
            Self::AttachFiles => &[
                Relation::Owner,
                Relation::AssignedTeamLead,
                Relation::Administrator,
            ],
            Self::RecordException => &[Relation::Owner, Relation::AssignedTeamLead],
            Self::Administer => &[Relation::Administrator],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::View => f.write_str("view report"),
            Self::Edit => f.write_str("edit report"),
            Self::Delete => f.write_str("delete report"),
            Self::Transition(kind) => write!(f, "{kind}"),
            Self::AttachFiles => f.write_str("attach files"),
            Self::RecordException => f.write_str("record exception"),
            Self::Administer => f.write_str("administer report"),
            Self::MarkNotesRead => f.write_str("mark notes read"),
        }
    }
}

/// The parts of a report the guard looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportScope {
    pub owner_user_id: UserId,
    /// Assigned team, already resolved through the directory fallback.
    pub team_id: Option<TeamId>,
}

pub struct AccessGuard;

impl AccessGuard {
    /// A request must carry some caller reference.
    pub fn identify(caller: Option<&UserRef>) -> Result<&UserRef, WorkflowError> {
        caller.ok_or_else(|| WorkflowError::Unauthorized("caller identity is missing".into()))
    }

    pub fn relations(user: &UserRecord, scope: &ReportScope) -> Vec<Relation> {
        let mut relations = Vec::with_capacity(3);
        if user.id == scope.owner_user_id {
            relations.push(Relation::Owner);
        }
        if user.is_team_lead()
            && user.assigned_team_id.is_some()
            && user.assigned_team_id == scope.team_id
        {
            relations.push(Relation::AssignedTeamLead);
        }
        if user.is_admin() {
            relations.push(Relation::Administrator);
        }
        relations
    }

    pub fn require(
        user: &UserRecord,
        capability: Capability,
        scope: &ReportScope,
    ) -> Result<(), WorkflowError> {
        let admitted = capability.admitted();
        if admitted.is_empty() {
            return Ok(());
        }
        let held = Self::relations(user, scope);
        if admitted.iter().any(|relation| held.contains(relation)) {
            return Ok(());
        }
        let required = admitted
            .iter()
            .map(Relation::as_str)
            .collect::<Vec<_>>()
            .join(" or ");
        Err(WorkflowError::Forbidden(format!(
            "{} may not {capability}: requires {required}",
            user.username
        )))
    }

    /// Sub-API gate: administrators always pass, everyone else needs the flag.
    pub fn require_permission(
        user: &UserRecord,
        flag: PermissionFlag,
    ) -> Result<(), WorkflowError> {
        if user.is_admin() || user.permissions.has(flag) {
            Ok(())
        } else {
            Err(WorkflowError::Forbidden(format!(
                "{} lacks the {flag:?} permission",
                user.username
            )))
        }
    }

    pub fn require_submit(user: &UserRecord, report_type: ReportType) -> Result<(), WorkflowError> {
        if user.may_submit(report_type) {
            Ok(())
        } else {
            Err(WorkflowError::Forbidden(format!(
                "{} may not submit {report_type} reports",
                user.username
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PermissionFlags, Role};

    fn user(id: UserId, role: Role, team: Option<TeamId>) -> UserRecord {
        UserRecord {
            id,
            username: format!("user-{id}"),
            full_name: format!("User {id}"),
            role,
            assigned_team_id: team,
            permissions: PermissionFlags::default(),
            allowed_report_types: None,
        }
    }

    const SCOPE: ReportScope = ReportScope {
        owner_user_id: 1,
        team_id: Some(10),
    };

    #[test]
    fn missing_caller_is_unauthorized() {
        let err = AccessGuard::identify(None).unwrap_err();
        assert!(matches!(err, WorkflowError::Unauthorized(_)));
        assert_eq!(err.http_status(), 401);
    }

    #[test]
    fn only_the_assigned_team_lead_confirms_concrete() {
        let cap = Capability::Transition(TransitionKind::ConfirmConcrete);
        let lead = user(2, Role::TeamLead, Some(10));
        assert!(AccessGuard::require(&lead, cap, &SCOPE).is_ok());

        let other_team = AccessGuard::require(&user(3, Role::TeamLead, Some(11)), cap, &SCOPE);
        assert!(matches!(other_team, Err(WorkflowError::Forbidden(_))));

        let owner = AccessGuard::require(&user(1, Role::Employee, None), cap, &SCOPE);
        assert!(matches!(owner, Err(WorkflowError::Forbidden(_))));

        let admin = AccessGuard::require(&user(4, Role::Admin, None), cap, &SCOPE);
        assert!(matches!(admin, Err(WorkflowError::Forbidden(_))));
    }

    #[test]
    fn unassigned_team_lead_never_matches_unassigned_report() {
        let scope = ReportScope {
            owner_user_id: 1,
            team_id: None,
        };
        let cap = Capability::Transition(TransitionKind::AcceptTeam);
        let floating_lead = user(2, Role::TeamLead, None);
        assert!(AccessGuard::require(&floating_lead, cap, &scope).is_err());
    }

    #[test]
    fn only_the_owner_confirms_second_payment() {
        let cap = Capability::Transition(TransitionKind::ConfirmSecondPayment);
        let owner = user(1, Role::Employee, None);
        let lead = user(2, Role::TeamLead, Some(10));
        assert!(AccessGuard::require(&owner, cap, &SCOPE).is_ok());
        assert!(AccessGuard::require(&lead, cap, &SCOPE).is_err());
    }

    #[test]
    fn forbidden_message_names_required_relation() {
        let err = AccessGuard::require(
            &user(5, Role::Employee, None),
            Capability::Administer,
            &SCOPE,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "forbidden: user-5 may not administer report: requires administrator"
        );
    }

    #[test]
    fn exceptions_are_for_owner_or_team_lead() {
        let cap = Capability::RecordException;
        for (caller, admitted) in [
            (user(1, Role::Employee, None), true),
            (user(2, Role::TeamLead, Some(10)), true),
            (user(9, Role::Employee, None), false),
        ] {
            let result = AccessGuard::require(&caller, cap, &SCOPE);
            assert_eq!(result.is_ok(), admitted, "{}", caller.username);
        }
    }

    #[test]
    fn view_is_open_to_identified_users() {
        let stranger = user(9, Role::Employee, None);
        assert!(AccessGuard::require(&stranger, Capability::View, &SCOPE).is_ok());
    }

    #[test]
    fn permission_flag_or_admin_opens_sub_api() {
        let mut buyer = user(6, Role::Employee, None);
        let purchases = PermissionFlag::PurchaseManagement;
        assert!(AccessGuard::require_permission(&buyer, purchases).is_err());

        buyer.permissions.purchase_management = true;
        assert!(AccessGuard::require_permission(&buyer, purchases).is_ok());
        let trade = PermissionFlag::ImportExport;
        assert!(AccessGuard::require_permission(&buyer, trade).is_err());

        let admin = user(7, Role::Admin, None);
        let packages = PermissionFlag::PackageManagement;
        assert!(AccessGuard::require_permission(&admin, packages).is_ok());
    }

    #[test]
    fn submission_respects_allowed_report_types() {
        let mut employee = user(8, Role::Employee, None);
        employee.allowed_report_types = Some(vec![ReportType::Sales]);
        assert!(AccessGuard::require_submit(&employee, ReportType::Sales).is_ok());
        assert!(matches!(
            AccessGuard::require_submit(&employee, ReportType::Project),
            Err(WorkflowError::Forbidden(_))
        ));
    }
}
