//! Per-caller response filtering.
//!
//! A team lead looking at a project report only sees the stage files they
//! uploaded themselves, matched by id or by username on older records.
//! Everyone else gets the report as stored.

use crate::types::{Report, UserRecord};

pub fn filter_for_caller(mut report: Report, caller: &UserRecord) -> Report {
    if !caller.is_team_lead() {
        return report;
    }
    if let Some(project) = report.content.as_project_mut() {
        for record in project.updates.iter_mut() {
            record.files.retain(|file| file.uploaded_by_user(caller));
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ReportContent;
    use crate::stage::StageId;
    use crate::types::{Attachment, PermissionFlags, ReportType, Role, StageRecord, UserRef};

    fn caller(id: i64, role: Role) -> UserRecord {
        UserRecord {
            id,
            username: format!("u{id}"),
            full_name: String::new(),
            role,
            assigned_team_id: Some(1),
            permissions: PermissionFlags::default(),
            allowed_report_types: None,
        }
    }

    fn file(name: &str, by: i64) -> Attachment {
        uploaded(name, Some(UserRef::Id(by)))
    }

    fn uploaded(name: &str, by: Option<UserRef>) -> Attachment {
        Attachment {
            id: name.into(),
            url: format!("memory://{name}"),
            file_name: name.into(),
            uploaded_by: by,
        }
    }

    fn report_with_mixed_files() -> Report {
        let mut report = Report::new(1, None, ReportContent::empty(ReportType::Project));
        let project = report.content.as_project_mut().unwrap();
        let mut concrete = StageRecord::pending(StageId::ConcreteWorks);
        concrete.files = vec![file("a1", 10), file("b1", 20)];
        let mut handover = StageRecord::pending(StageId::DeliveryHandover);
        handover.files = vec![file("b2", 20), file("a2", 10)];
        project.updates = vec![concrete, handover];
        report
    }

    fn file_ids(report: &Report) -> Vec<Vec<String>> {
        report
            .content
            .as_project()
            .unwrap()
            .updates
            .iter()
            .map(|r| r.files.iter().map(|f| f.id.clone()).collect())
            .collect()
    }

    #[test]
    fn team_lead_sees_only_own_uploads() {
        let lead = caller(20, Role::TeamLead);
        let filtered = filter_for_caller(report_with_mixed_files(), &lead);
        assert_eq!(file_ids(&filtered), vec![vec!["b1"], vec!["b2"]]);
    }

    #[test]
    fn team_lead_matches_username_uploads_and_skips_unknown_uploaders() {
        let mut report = report_with_mixed_files();
        let project = report.content.as_project_mut().unwrap();
        project.updates[0].files = vec![
            uploaded("legacy", Some(UserRef::Username("u20".into()))),
            uploaded("bare", None),
            uploaded("other", Some(UserRef::Username("u10".into()))),
        ];

        let filtered = filter_for_caller(report, &caller(20, Role::TeamLead));
        assert_eq!(file_ids(&filtered), vec![vec!["legacy"], vec!["b2"]]);
    }

    #[test]
    fn admin_and_employee_see_everything() {
        for role in [Role::Admin, Role::Employee] {
            let filtered = filter_for_caller(report_with_mixed_files(), &caller(20, role));
            assert_eq!(
                file_ids(&filtered),
                vec![vec!["a1", "b1"], vec!["b2", "a2"]]
            );
        }
    }

    #[test]
    fn non_project_reports_untouched() {
        let report = Report::new(1, None, ReportContent::empty(ReportType::Sales));
        let filtered = filter_for_caller(report.clone(), &caller(20, Role::TeamLead));
        assert_eq!(filtered, report);
    }
}
