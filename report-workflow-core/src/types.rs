//! Report Aggregate Types
//!
//! The report aggregate root, the records nested inside project content, and
//! the identity types the access guard works with.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::content::{lenient, ReportContent};
use crate::error::WorkflowError;
use crate::stage::{StageId, WorkflowState};

// ─── Scalar aliases ───────────────────────────────────────────

/// Numeric user id from the user directory.
pub type UserId = i64;

/// Technical team id.
pub type TeamId = i64;

/// Organisational branch id.
pub type BranchId = i64;

// ─── Report classification ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportType {
    Inquiry,
    Maintenance,
    Sales,
    Project,
}

impl ReportType {
    pub const ALL: [ReportType; 4] = [
        ReportType::Inquiry,
        ReportType::Maintenance,
        ReportType::Sales,
        ReportType::Project,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inquiry => "Inquiry",
            Self::Maintenance => "Maintenance",
            Self::Sales => "Sales",
            Self::Project => "Project",
        }
    }
}

impl FromStr for ReportType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| WorkflowError::InvalidInput(format!("unknown report type: {s}")))
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse administrative lifecycle label, independent of the workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReportStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
        }
    }
}

impl FromStr for ReportStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(WorkflowError::InvalidInput(format!("unknown report status: {s}"))),
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Evidence and history records ─────────────────────────────

/// A stored file reference. Owned by exactly one stage or exception record.
///
/// Older rows store a file as a bare URL string, or key the uploader by
/// username; both shapes decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "AttachmentRepr")]
pub struct Attachment {
    pub id: String,
    pub url: String,
    pub file_name: String,
    /// Unknown for legacy bare-URL files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<UserRef>,
}

impl Attachment {
    pub fn uploaded_by_user(&self, user: &UserRecord) -> bool {
        self.uploaded_by
            .as_ref()
            .is_some_and(|uploader| uploader.refers_to(user))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AttachmentRepr {
    Url(String),
    #[serde(rename_all = "camelCase")]
    Stored {
        #[serde(default)]
        id: Option<String>,
        url: String,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default, deserialize_with = "lenient::optional")]
        uploaded_by: Option<UserRef>,
    },
}

impl From<AttachmentRepr> for Attachment {
    fn from(repr: AttachmentRepr) -> Self {
        let (id, url, file_name, uploaded_by) = match repr {
            AttachmentRepr::Url(url) => (None, url, None, None),
            AttachmentRepr::Stored {
                id,
                url,
                file_name,
                uploaded_by,
            } => (id, url, file_name, uploaded_by),
        };
        let file_name = file_name.unwrap_or_else(|| file_name_of(&url));
        Self {
            id: id.unwrap_or_else(|| url.clone()),
            url,
            file_name,
            uploaded_by,
        }
    }
}

/// Last path segment of a URL, without query string.
fn file_name_of(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(path)
        .to_string()
}

/// One entry of a project's `updates` list, looked up by `id`, never by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(
        default,
        deserialize_with = "lenient::optional_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub files: Vec<Attachment>,
    /// Keys written by older clients that this model does not name.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StageRecord {
    /// Fresh, not yet completed record for a stage.
    pub fn pending(stage: StageId) -> Self {
        Self {
            id: stage.as_str().to_string(),
            label: stage.label().to_string(),
            completed: false,
            timestamp: None,
            comment: None,
            files: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn is(&self, stage: StageId) -> bool {
        self.id == stage.as_str()
    }
}

/// Out-of-band incident note; never affects stage progression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionRecord {
    pub id: String,
    pub comment: String,
    #[serde(default, deserialize_with = "lenient::list")]
    pub files: Vec<Attachment>,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub timestamp: DateTime<Utc>,
    pub uploaded_by: UserRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteReply {
    pub id: String,
    pub author_id: UserRef,
    pub author_name: String,
    pub content: String,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Threaded administrator comment on a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminNote {
    pub id: String,
    pub author_id: UserRef,
    pub author_name: String,
    pub content: String,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub replies: Vec<NoteReply>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub read_by: Vec<UserRef>,
}

impl AdminNote {
    pub fn is_read_by(&self, user: &UserRecord) -> bool {
        self.read_by.iter().any(|reader| reader.refers_to(user))
    }
}

/// Administrator's assessment of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub evaluated_by: UserId,
    pub evaluated_at: DateTime<Utc>,
}

/// Edit-history entry appended by every plain field edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modification {
    pub modified_by: UserId,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub modified_at: DateTime<Utc>,
    /// Client-facing names of the fields that changed.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Version the edit produced.
    #[serde(default)]
    pub version: i64,
}

// ─── Aggregate root ───────────────────────────────────────────

/// A field report and its type-specific content.
///
/// Serializes to the camelCase shape clients expect, with `type` and
/// `details` carried by the flattened [`ReportContent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: Uuid,
    pub owner_user_id: UserId,
    pub branch_id: Option<BranchId>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: ReportStatus,
    #[serde(rename = "projectWorkflowStatus")]
    pub workflow_status: Option<WorkflowState>,
    pub assigned_team_id: Option<TeamId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    #[serde(flatten)]
    pub content: ReportContent,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modifications: Vec<Modification>,
    /// Optimistic concurrency token, bumped on every persisted mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Report {
    /// Build a new report; project reports start in the initial workflow state.
    pub fn new(
        owner_user_id: UserId,
        branch_id: Option<BranchId>,
        content: ReportContent,
    ) -> Self {
        let now = Utc::now();
        let workflow_status = match content.report_type() {
            ReportType::Project => Some(WorkflowState::INITIAL),
            _ => None,
        };
        Self {
            id: Uuid::new_v4(),
            owner_user_id,
            branch_id,
            title: None,
            description: None,
            status: ReportStatus::Pending,
            workflow_status,
            assigned_team_id: None,
            evaluation: None,
            content,
            modifications: Vec::new(),
            version: 0,
            created_at: now,
            last_modified: now,
        }
    }

    pub fn report_type(&self) -> ReportType {
        self.content.report_type()
    }

    pub fn is_owned_by(&self, user: &UserRecord) -> bool {
        self.owner_user_id == user.id
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

// ─── Identity ─────────────────────────────────────────────────

/// How a caller identifies itself: numeric id or username.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserRef {
    Id(UserId),
    Username(String),
}

impl UserRef {
    /// All-digit strings are numeric ids; anything else is a username.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = raw.parse::<UserId>() {
                return Some(Self::Id(id));
            }
        }
        Some(Self::Username(raw.to_string()))
    }

    pub fn refers_to(&self, user: &UserRecord) -> bool {
        match self {
            Self::Id(id) => *id == user.id,
            Self::Username(name) => *name == user.username,
        }
    }
}

/// Numeric ids serialize as numbers, usernames as strings.
impl Serialize for UserRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Id(id) => serializer.serialize_i64(*id),
            Self::Username(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for UserRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Id(UserId),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Id(id) => Ok(Self::Id(id)),
            Raw::Text(text) => {
                Self::parse(&text).ok_or_else(|| D::Error::custom("empty user reference"))
            }
        }
    }
}

impl From<UserId> for UserRef {
    fn from(id: UserId) -> Self {
        Self::Id(id)
    }
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Username(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    TeamLead,
    Employee,
}

impl Role {
    /// Case- and punctuation-insensitive; unrecognised roles get no privileges.
    pub fn parse_lenient(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "admin" | "administrator" => Self::Admin,
            "teamlead" | "teamleader" => Self::TeamLead,
            _ => Self::Employee,
        }
    }
}

/// Per-user flags, each granting a whole sub-API regardless of role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionFlag {
    PurchaseManagement,
    PackageManagement,
    ImportExport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionFlags {
    pub purchase_management: bool,
    pub package_management: bool,
    pub import_export: bool,
}

impl PermissionFlags {
    pub fn has(&self, flag: PermissionFlag) -> bool {
        match flag {
            PermissionFlag::PurchaseManagement => self.purchase_management,
            PermissionFlag::PackageManagement => self.package_management,
            PermissionFlag::ImportExport => self.import_export,
        }
    }
}

/// Directory entry for a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub full_name: String,
    pub role: Role,
    pub assigned_team_id: Option<TeamId>,
    #[serde(default)]
    pub permissions: PermissionFlags,
    /// `None` means every report type is allowed.
    #[serde(default)]
    pub allowed_report_types: Option<Vec<ReportType>>,
}

impl UserRecord {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_team_lead(&self) -> bool {
        self.role == Role::TeamLead
    }

    pub fn may_submit(&self, report_type: ReportType) -> bool {
        self.allowed_report_types
            .as_ref()
            .map(|allowed| allowed.contains(&report_type))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ref_distinguishes_ids_from_usernames() {
        assert_eq!(UserRef::parse("42"), Some(UserRef::Id(42)));
        assert_eq!(
            UserRef::parse("EMP-042"),
            Some(UserRef::Username("EMP-042".into()))
        );
        assert_eq!(UserRef::parse("   "), None);
    }

    #[test]
    fn user_refs_keep_their_wire_shape() {
        let refs: Vec<UserRef> = serde_json::from_str(r#"[7, "12", "EMP-042"]"#).unwrap();
        assert_eq!(
            refs,
            vec![
                UserRef::Id(7),
                UserRef::Id(12),
                UserRef::Username("EMP-042".into()),
            ]
        );
        assert_eq!(
            serde_json::to_string(&refs).unwrap(),
            r#"[7,12,"EMP-042"]"#
        );
        assert!(serde_json::from_str::<UserRef>(r#""  ""#).is_err());
    }

    #[test]
    fn user_ref_matches_id_or_username() {
        let user = UserRecord {
            id: 42,
            username: "EMP-042".into(),
            full_name: String::new(),
            role: Role::TeamLead,
            assigned_team_id: None,
            permissions: PermissionFlags::default(),
            allowed_report_types: None,
        };
        assert!(UserRef::Id(42).refers_to(&user));
        assert!(UserRef::Username("EMP-042".into()).refers_to(&user));
        assert!(!UserRef::Username("EMP-043".into()).refers_to(&user));
    }

    #[test]
    fn bare_url_files_decode() {
        let files: Vec<Attachment> = serde_json::from_value(serde_json::json!([
            "https://bucket/site/slab.jpg?token=abc",
            {"url": "https://bucket/inverter.png", "uploadedBy": "EMP-042"},
            {"id": "f1", "url": "u", "fileName": "roof.jpg", "uploadedBy": 3}
        ]))
        .unwrap();

        assert_eq!(files[0].id, "https://bucket/site/slab.jpg?token=abc");
        assert_eq!(files[0].file_name, "slab.jpg");
        assert_eq!(files[0].uploaded_by, None);
        assert_eq!(files[1].file_name, "inverter.png");
        assert_eq!(
            files[1].uploaded_by,
            Some(UserRef::Username("EMP-042".into()))
        );
        assert_eq!(files[2].uploaded_by, Some(UserRef::Id(3)));

        let encoded = serde_json::to_value(&files[0]).unwrap();
        assert_eq!(encoded["url"], "https://bucket/site/slab.jpg?token=abc");
        assert!(encoded.get("uploadedBy").is_none());
    }

    #[test]
    fn role_parsing_is_lenient() {
        assert_eq!(Role::parse_lenient("Admin"), Role::Admin);
        assert_eq!(Role::parse_lenient("team_lead"), Role::TeamLead);
        assert_eq!(Role::parse_lenient("Team Lead"), Role::TeamLead);
        assert_eq!(Role::parse_lenient("technician"), Role::Employee);
    }

    #[test]
    fn report_type_and_status_parse_case_insensitively() {
        assert_eq!(
            "project".parse::<ReportType>().unwrap(),
            ReportType::Project
        );
        assert_eq!(
            "APPROVED".parse::<ReportStatus>().unwrap(),
            ReportStatus::Approved
        );
        assert!("Archive".parse::<ReportType>().is_err());
    }

    #[test]
    fn allowed_report_types_restrict_submission() {
        let mut user = UserRecord {
            id: 7,
            username: "EMP-7".into(),
            full_name: "Field Engineer".into(),
            role: Role::Employee,
            assigned_team_id: None,
            permissions: PermissionFlags::default(),
            allowed_report_types: None,
        };
        assert!(user.may_submit(ReportType::Project));

        user.allowed_report_types = Some(vec![ReportType::Maintenance]);
        assert!(user.may_submit(ReportType::Maintenance));
        assert!(!user.may_submit(ReportType::Project));
    }

    #[test]
    fn new_project_report_starts_in_draft() {
        let report = Report::new(1, Some(3), ReportContent::empty(ReportType::Project));
        assert_eq!(report.workflow_status, Some(WorkflowState::Draft));
        assert_eq!(report.status, ReportStatus::Pending);

        let sales = Report::new(1, None, ReportContent::empty(ReportType::Sales));
        assert_eq!(sales.workflow_status, None);
    }

    #[test]
    fn report_serializes_type_and_details_at_top_level() {
        let report = Report::new(5, None, ReportContent::empty(ReportType::Project));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "Project");
        assert_eq!(json["projectWorkflowStatus"], "Draft");
        assert_eq!(json["ownerUserId"], 5);
        assert!(json["details"]["updates"].as_array().unwrap().is_empty());
    }
}
