//! Report Content Model
//!
//! Type-specific `details` payload of a report, one variant per report type.
//! Stored as JSON text next to the report row; decoding never fails. Content
//! that cannot be read is logged and replaced by the documented default (an
//! empty payload, or an empty list for list-shaped fields) so that a single
//! bad legacy row cannot make a report unreadable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::types::{AdminNote, ExceptionRecord, ReportType, StageRecord};

/// Content that could not be decoded. Recovered locally, never returned to callers.
#[derive(Debug, Error)]
#[error("malformed {report_type} content: {reason}")]
pub struct MalformedContent {
    pub report_type: ReportType,
    pub reason: String,
}

// ─── Payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub phone: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub location: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InquiryContent {
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub customer: Option<CustomerInfo>,
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub subject: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub admin_notes: Vec<AdminNote>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceContent {
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub customer: Option<CustomerInfo>,
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub system_type: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub issue_description: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub actions_taken: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub before_images: Vec<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub after_images: Vec<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub admin_notes: Vec<AdminNote>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesContent {
    #[serde(default, deserialize_with = "lenient::list")]
    pub customers: Vec<CustomerInfo>,
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub admin_notes: Vec<AdminNote>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Project payload: customer data plus the workflow history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContent {
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub project_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub customer: Option<CustomerInfo>,
    #[serde(
        default,
        deserialize_with = "lenient::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub system_capacity_kw: Option<f64>,
    /// Stage records, keyed by `id`. Order is append order, not graph order.
    #[serde(default, deserialize_with = "lenient::list")]
    pub updates: Vec<StageRecord>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub exceptions: Vec<ExceptionRecord>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub admin_notes: Vec<AdminNote>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectContent {
    /// Merge duplicate stage ids into their first occurrence and backfill
    /// missing completion timestamps.
    pub fn normalize(&mut self, fallback_timestamp: DateTime<Utc>) {
        let mut merged: Vec<StageRecord> = Vec::with_capacity(self.updates.len());
        for record in self.updates.drain(..) {
            match merged.iter_mut().find(|existing| existing.id == record.id) {
                Some(existing) => {
                    warn!(stage = %record.id, "merging duplicate stage record");
                    existing.files.extend(record.files);
                    if record.completed && !existing.completed {
                        existing.completed = true;
                        existing.timestamp = record.timestamp;
                    }
                    if existing.comment.is_none() {
                        existing.comment = record.comment;
                    }
                }
                None => merged.push(record),
            }
        }
        for record in merged.iter_mut() {
            if record.completed && record.timestamp.is_none() {
                record.timestamp = Some(fallback_timestamp);
            }
        }
        self.updates = merged;
    }
}

// ─── Tagged union ─────────────────────────────────────────────

/// Report payload; the variant is the report type.
///
/// On the wire this is `{"type": "...", "details": {...}}`; in storage only
/// the `details` object is written, the type lives in its own column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum ReportContent {
    Inquiry(InquiryContent),
    Maintenance(MaintenanceContent),
    Sales(SalesContent),
    Project(ProjectContent),
}

impl ReportContent {
    pub fn empty(report_type: ReportType) -> Self {
        match report_type {
            ReportType::Inquiry => Self::Inquiry(InquiryContent::default()),
            ReportType::Maintenance => Self::Maintenance(MaintenanceContent::default()),
            ReportType::Sales => Self::Sales(SalesContent::default()),
            ReportType::Project => Self::Project(ProjectContent::default()),
        }
    }

    pub fn report_type(&self) -> ReportType {
        match self {
            Self::Inquiry(_) => ReportType::Inquiry,
            Self::Maintenance(_) => ReportType::Maintenance,
            Self::Sales(_) => ReportType::Sales,
            Self::Project(_) => ReportType::Project,
        }
    }

    pub fn as_project(&self) -> Option<&ProjectContent> {
        match self {
            Self::Project(project) => Some(project),
            _ => None,
        }
    }

    pub fn as_project_mut(&mut self) -> Option<&mut ProjectContent> {
        match self {
            Self::Project(project) => Some(project),
            _ => None,
        }
    }

    pub fn admin_notes(&self) -> &[AdminNote] {
        match self {
            Self::Inquiry(c) => &c.admin_notes,
            Self::Maintenance(c) => &c.admin_notes,
            Self::Sales(c) => &c.admin_notes,
            Self::Project(c) => &c.admin_notes,
        }
    }

    pub fn admin_notes_mut(&mut self) -> &mut Vec<AdminNote> {
        match self {
            Self::Inquiry(c) => &mut c.admin_notes,
            Self::Maintenance(c) => &mut c.admin_notes,
            Self::Sales(c) => &mut c.admin_notes,
            Self::Project(c) => &mut c.admin_notes,
        }
    }

    /// Storage text for the `details` column. Never fails.
    pub fn encode_details(&self) -> String {
        let encoded = match self {
            Self::Inquiry(c) => serde_json::to_string(c),
            Self::Maintenance(c) => serde_json::to_string(c),
            Self::Sales(c) => serde_json::to_string(c),
            Self::Project(c) => serde_json::to_string(c),
        };
        encoded.unwrap_or_else(|e| {
            warn!(
                report_type = %self.report_type(),
                error = %e,
                "content encoding failed, storing empty object"
            );
            "{}".to_string()
        })
    }

    /// Strict decode of the `details` column; absent or blank text is empty content.
    pub fn try_decode(
        report_type: ReportType,
        raw: Option<&str>,
    ) -> Result<Self, MalformedContent> {
        let malformed = |reason: String| MalformedContent {
            report_type,
            reason,
        };

        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self::empty(report_type));
        };

        let value: Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
        // Older writers stored the object double-encoded as a JSON string.
        let value = match value {
            Value::String(inner) => {
                serde_json::from_str(&inner).map_err(|e| malformed(e.to_string()))?
            }
            other => other,
        };

        match value {
            Value::Null => Ok(Self::empty(report_type)),
            Value::Object(_) => {
                let content = match report_type {
                    ReportType::Inquiry => serde_json::from_value(value).map(Self::Inquiry),
                    ReportType::Maintenance => serde_json::from_value(value).map(Self::Maintenance),
                    ReportType::Sales => serde_json::from_value(value).map(Self::Sales),
                    ReportType::Project => serde_json::from_value(value).map(Self::Project),
                };
                content.map_err(|e| malformed(e.to_string()))
            }
            other => Err(malformed(format!(
                "expected an object, found {}",
                lenient::kind(&other)
            ))),
        }
    }

    /// Lossy decode: malformed content is logged and replaced by empty content.
    pub fn decode(report_type: ReportType, raw: Option<&str>) -> Self {
        Self::try_decode(report_type, raw).unwrap_or_else(|err| {
            warn!(error = %err, "recovering report content with default");
            Self::empty(report_type)
        })
    }

    /// Decode and restore structural invariants of the stage list.
    pub fn decode_normalized(
        report_type: ReportType,
        raw: Option<&str>,
        fallback_timestamp: DateTime<Utc>,
    ) -> Self {
        let mut content = Self::decode(report_type, raw);
        if let Some(project) = content.as_project_mut() {
            project.normalize(fallback_timestamp);
        }
        content
    }
}

/// Forgiving field deserializers for legacy content.
pub mod lenient {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
    use serde::de::{DeserializeOwned, Error as _};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use tracing::warn;

    /// Naive formats written by older MySQL-backed clients, read as UTC.
    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    /// Below this, a numeric timestamp is taken as seconds rather than millis.
    const EPOCH_MILLIS_FLOOR: i64 = 100_000_000_000;

    /// List field: unwraps string-encoded arrays, treats anything that is not
    /// an array as empty and skips elements that do not decode.
    pub fn list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(list_from_value(value))
    }

    /// Optional field: anything that does not decode becomes `None`.
    pub fn optional<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            return Ok(None);
        }
        match serde_json::from_value(value) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(error = %e, "dropping malformed optional field");
                Ok(None)
            }
        }
    }

    pub fn list_from_value<T: DeserializeOwned>(value: Value) -> Vec<T> {
        let value = match value {
            Value::String(encoded) => match serde_json::from_str::<Value>(&encoded) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(error = %e, "unparseable string in list field, defaulting to empty");
                    return Vec::new();
                }
            },
            other => other,
        };

        match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match serde_json::from_value(item) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        warn!(error = %e, "skipping malformed list element");
                        None
                    }
                })
                .collect(),
            Value::Null => Vec::new(),
            other => {
                warn!(found = kind(&other), "expected a list, defaulting to empty");
                Vec::new()
            }
        }
    }

    /// RFC 3339, naive date-time, bare date or epoch number.
    pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
        match value {
            Value::String(raw) => parse_timestamp_str(raw.trim()),
            Value::Number(number) => {
                let n = number.as_i64()?;
                if n.abs() < EPOCH_MILLIS_FLOOR {
                    DateTime::from_timestamp(n, 0)
                } else {
                    DateTime::from_timestamp_millis(n)
                }
            }
            _ => None,
        }
    }

    fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })
            .map(|naive| naive.and_utc())
    }

    /// Required timestamp in any format [`parse_timestamp`] reads.
    pub fn timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        parse_timestamp(&value)
            .ok_or_else(|| D::Error::custom(format!("unreadable timestamp {value}")))
    }

    /// Optional timestamp: an unreadable value is logged and treated as absent.
    pub fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            return Ok(None);
        }
        let parsed = parse_timestamp(&value);
        if parsed.is_none() {
            warn!(value = %value, "dropping unreadable timestamp");
        }
        Ok(parsed)
    }

    pub fn kind(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Attachment, UserRef};
    use chrono::TimeZone;
    use serde_json::json;

    fn attachment(id: &str, by: i64) -> Attachment {
        Attachment {
            id: id.into(),
            url: format!("https://files.example/{id}"),
            file_name: format!("{id}.jpg"),
            uploaded_by: Some(UserRef::Id(by)),
        }
    }

    #[test]
    fn project_details_round_trip() {
        let mut project = ProjectContent {
            project_name: Some("Rooftop 40kW".into()),
            system_capacity_kw: Some(40.5),
            ..Default::default()
        };
        let mut stage = StageRecord::pending(crate::stage::StageId::ConcreteWorks);
        stage.completed = true;
        stage.timestamp = Some(Utc::now());
        stage.files.push(attachment("a1", 3));
        project.updates.push(stage);
        project
            .extra
            .insert("inverterModel".into(), json!("SUN-40K"));

        let content = ReportContent::Project(project);
        let encoded = content.encode_details();
        let decoded = ReportContent::try_decode(ReportType::Project, Some(&encoded));
        assert_eq!(decoded.unwrap(), content);
    }

    #[test]
    fn maintenance_details_round_trip() {
        let content = ReportContent::Maintenance(MaintenanceContent {
            issue_description: Some("Inverter fault E21".into()),
            before_images: vec!["https://files.example/b.jpg".into()],
            ..Default::default()
        });
        let decoded =
            ReportContent::decode(ReportType::Maintenance, Some(&content.encode_details()));
        assert_eq!(decoded, content);
    }

    #[test]
    fn corrupted_text_decodes_to_default() {
        let decoded = ReportContent::decode(ReportType::Project, Some("{\"updates\": [tru"));
        assert_eq!(decoded, ReportContent::empty(ReportType::Project));

        let err = ReportContent::try_decode(ReportType::Sales, Some("[1,2]")).unwrap_err();
        assert_eq!(err.report_type, ReportType::Sales);
    }

    #[test]
    fn blank_or_null_details_are_empty() {
        assert_eq!(
            ReportContent::decode(ReportType::Inquiry, None),
            ReportContent::empty(ReportType::Inquiry)
        );
        assert_eq!(
            ReportContent::decode(ReportType::Inquiry, Some("  ")),
            ReportContent::empty(ReportType::Inquiry)
        );
        assert_eq!(
            ReportContent::decode(ReportType::Inquiry, Some("null")),
            ReportContent::empty(ReportType::Inquiry)
        );
    }

    #[test]
    fn double_encoded_details_are_unwrapped() {
        let inner = json!({"projectName": "Farm pump"}).to_string();
        let raw = serde_json::to_string(&inner).unwrap();
        let decoded = ReportContent::decode(ReportType::Project, Some(&raw));
        assert_eq!(
            decoded.as_project().unwrap().project_name.as_deref(),
            Some("Farm pump")
        );
    }

    #[test]
    fn list_fields_default_to_empty_and_skip_bad_elements() {
        let raw = json!({
            "updates": "not json at all",
            "exceptions": 17,
            "adminNotes": [
                {"id": "n1", "authorId": 1, "authorName": "Ops", "content": "ok",
                 "timestamp": "2025-03-01T10:00:00Z"},
                {"id": "n2"}
            ]
        })
        .to_string();
        let decoded = ReportContent::decode(ReportType::Project, Some(&raw));
        let project = decoded.as_project().unwrap();
        assert!(project.updates.is_empty());
        assert!(project.exceptions.is_empty());
        assert_eq!(project.admin_notes.len(), 1);
        assert_eq!(project.admin_notes[0].id, "n1");
    }

    #[test]
    fn string_encoded_stage_list_is_parsed() {
        let updates = json!([{"id": "secondPayment", "label": "Second payment"}]).to_string();
        let raw = json!({ "updates": updates }).to_string();
        let decoded = ReportContent::decode(ReportType::Project, Some(&raw));
        assert_eq!(decoded.as_project().unwrap().updates[0].id, "secondPayment");
    }

    #[test]
    fn malformed_optional_field_is_dropped_not_fatal() {
        let raw = json!({"customer": "Mr. Saleh", "projectName": "Villa"}).to_string();
        let decoded = ReportContent::decode(ReportType::Project, Some(&raw));
        let project = decoded.as_project().unwrap();
        assert!(project.customer.is_none());
        assert_eq!(project.project_name.as_deref(), Some("Villa"));
    }

    #[test]
    fn normalization_merges_duplicates_and_backfills_timestamps() {
        let raw = json!({
            "updates": [
                {"id": "concreteWorks", "completed": true,
                 "files": [{"id": "a", "url": "u", "fileName": "a.jpg", "uploadedBy": 1}]},
                {"id": "concreteWorks", "comment": "second writer",
                 "files": [{"id": "b", "url": "u", "fileName": "b.jpg", "uploadedBy": 2}]}
            ]
        })
        .to_string();
        let fallback = Utc::now();
        let decoded = ReportContent::decode_normalized(ReportType::Project, Some(&raw), fallback);
        let updates = &decoded.as_project().unwrap().updates;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].files.len(), 2);
        assert_eq!(updates[0].timestamp, Some(fallback));
        assert_eq!(updates[0].comment.as_deref(), Some("second writer"));
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let raw = json!({"customers": [{"name": "A", "crNumber": "1010"}], "campaign": "Q3"})
            .to_string();
        let decoded = ReportContent::decode(ReportType::Sales, Some(&raw));
        let reencoded: Value = serde_json::from_str(&decoded.encode_details()).unwrap();
        assert_eq!(reencoded["campaign"], "Q3");
        assert_eq!(reencoded["customers"][0]["crNumber"], "1010");
    }

    fn legacy_project_details() -> String {
        json!({
            "updates": [
                {"id": "concreteWorks", "completed": true,
                 "timestamp": "2025-01-02T08:30:00Z",
                 "files": ["https://bucket/slab.jpg"]},
                {"id": "secondPayment", "completed": true,
                 "timestamp": "2025-01-05 09:00:00"}
            ],
            "adminNotes": [
                {"id": "n1", "authorId": "EMP-042", "authorName": "Ops",
                 "content": "call the customer", "timestamp": 1736067600000_i64,
                 "readBy": ["EMP-042", 7]}
            ]
        })
        .to_string()
    }

    #[test]
    fn legacy_shapes_survive_decode_and_reencode() {
        let raw = legacy_project_details();
        let decoded = ReportContent::decode(ReportType::Project, Some(&raw));
        let project = decoded.as_project().unwrap();

        assert_eq!(project.updates.len(), 2);
        let slab = &project.updates[0].files[0];
        assert_eq!(slab.url, "https://bucket/slab.jpg");
        assert_eq!(slab.file_name, "slab.jpg");
        assert_eq!(
            project.updates[1].timestamp,
            Some(Utc.with_ymd_and_hms(2025, 1, 5, 9, 0, 0).unwrap())
        );
        let note = &project.admin_notes[0];
        assert_eq!(note.author_id, UserRef::Username("EMP-042".into()));
        assert_eq!(note.timestamp.timestamp_millis(), 1_736_067_600_000);
        assert_eq!(note.read_by.len(), 2);
    }

    #[test]
    fn mutating_legacy_content_keeps_every_record() {
        let raw = legacy_project_details();
        let mut content = ReportContent::decode(ReportType::Project, Some(&raw));
        content.admin_notes_mut()[0].read_by.push(UserRef::Id(90));

        let stored = content.encode_details();
        let reread = ReportContent::decode(ReportType::Project, Some(&stored));
        assert_eq!(reread, content);

        let project = reread.as_project().unwrap();
        let ids: Vec<&str> = project.updates.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["concreteWorks", "secondPayment"]);
        for record in &project.updates {
            assert!(record.completed && record.timestamp.is_some());
        }
        assert_eq!(project.updates[0].files.len(), 1);
        assert_eq!(
            project.admin_notes[0].author_id,
            UserRef::Username("EMP-042".into())
        );
    }

    #[test]
    fn unreadable_stage_timestamp_is_backfilled_not_dropped() {
        let raw = json!({
            "updates": [{"id": "concreteWorks", "completed": true, "timestamp": "last tuesday"}]
        })
        .to_string();
        let fallback = Utc::now();
        let decoded = ReportContent::decode_normalized(ReportType::Project, Some(&raw), fallback);
        let updates = &decoded.as_project().unwrap().updates;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].timestamp, Some(fallback));
    }
}
