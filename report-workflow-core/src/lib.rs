//! Project Report Workflow Engine
//!
//! Drives solar-installation project reports through their ordered stages
//! (team acceptance, concrete works, second payment, finishing works,
//! completion, handover) and persists the report aggregate around each
//! transition.
//!
//! The engine consumes three collaborators through traits:
//! - [`UserDirectory`] resolves callers and their roles/permission flags
//! - [`DocumentStore`] stores uploaded evidence files
//! - [`Notifier`] delivers fire-and-forget push notifications
//!
//! Persistence goes through [`ReportRepository`]. An in-memory implementation
//! is always available; the Postgres implementation needs the `database`
//! feature.

pub mod config;
pub mod content;
pub mod directory;
pub mod document_store;
pub mod engine;
pub mod error;
pub mod guard;
pub mod machine;
pub mod notify;
pub mod repository;
pub mod stage;
pub mod types;
pub mod visibility;

pub use config::EngineConfig;
pub use content::{MaintenanceContent, ProjectContent, ReportContent, SalesContent};
pub use directory::{MemoryDirectory, UserDirectory};
pub use document_store::{
    DocumentStore, DocumentStoreError, FileUpload, LocalDocumentStore, MemoryDocumentStore,
    StoredDocument,
};
pub use engine::{NewReport, ReportEdit, ReportWorkflowEngine, StageConfirmation};
pub use error::WorkflowError;
pub use guard::{AccessGuard, Capability, Relation};
pub use machine::TransitionKind;
pub use notify::{LogNotifier, MemoryNotifier, Notification, Notifier, NotifyError};
pub use repository::{MemoryReportRepository, ReportRepository};
pub use stage::{StageId, WorkflowState};
pub use types::*;
