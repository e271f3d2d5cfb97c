//! Engine Configuration
//!
//! Loaded once at startup from `REPORT_WORKFLOW_*` environment variables or
//! from a YAML document. Every setting has a default.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::WorkflowError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-file upload deadline.
    pub upload_timeout_ms: u64,
    /// Deadline for one repository or directory call.
    pub store_timeout_ms: u64,
    /// Deadline for delivering one notification.
    pub notify_timeout_ms: u64,
    /// Folder prefix handed to the document store.
    pub upload_folder: String,
    /// Attach files sent without a stage id to the last stage record.
    pub legacy_orphan_attachment: bool,
    /// Let a completed stage be confirmed again to add more evidence.
    pub allow_reconfirmation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upload_timeout_ms: 30_000,
            store_timeout_ms: 5_000,
            notify_timeout_ms: 3_000,
            upload_folder: "report-attachments".to_string(),
            legacy_orphan_attachment: true,
            allow_reconfirmation: true,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            upload_timeout_ms: env_u64(
                "REPORT_WORKFLOW_UPLOAD_TIMEOUT_MS",
                defaults.upload_timeout_ms,
            ),
            store_timeout_ms: env_u64(
                "REPORT_WORKFLOW_STORE_TIMEOUT_MS",
                defaults.store_timeout_ms,
            ),
            notify_timeout_ms: env_u64(
                "REPORT_WORKFLOW_NOTIFY_TIMEOUT_MS",
                defaults.notify_timeout_ms,
            ),
            upload_folder: std::env::var("REPORT_WORKFLOW_UPLOAD_FOLDER")
                .unwrap_or(defaults.upload_folder),
            legacy_orphan_attachment: env_bool(
                "REPORT_WORKFLOW_LEGACY_ORPHAN_ATTACHMENT",
                defaults.legacy_orphan_attachment,
            ),
            allow_reconfirmation: env_bool(
                "REPORT_WORKFLOW_ALLOW_RECONFIRMATION",
                defaults.allow_reconfirmation,
            ),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, WorkflowError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WorkflowError::InvalidInput(format!("engine config: {e}")))
    }

    /// Explicit stage ids required on every upload.
    pub fn strict() -> Self {
        Self {
            legacy_orphan_attachment: false,
            allow_reconfirmation: false,
            ..Self::default()
        }
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
