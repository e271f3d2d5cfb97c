//! Notification Sink
//!
//! Best-effort delivery of "something happened on your report" messages.
//! Delivery failures are reported to the caller, which logs and moves on.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::types::UserId;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("no delivery target for user {0}")]
    NoTarget(UserId),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    /// Navigation payload for the client.
    pub data: BTreeMap<String, String>,
}

impl Notification {
    pub fn for_report(
        user_id: UserId,
        report_id: Uuid,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let mut data = BTreeMap::new();
        data.insert("reportId".to_string(), report_id.to_string());
        Self {
            user_id,
            title: title.into(),
            body: body.into(),
            data,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the trace log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            user_id = notification.user_id,
            title = %notification.title,
            body = %notification.body,
            "notification"
        );
        Ok(())
    }
}

/// Records notifications for assertions
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, user_id: UserId) -> Vec<Notification> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Delivery("sink offline".into()));
        }
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}
