//! Document Store
//!
//! Uploads evidence files (photos, PDFs) and hands back a retrievable URL.
//! Implementations can target the local filesystem or an object store.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// One file as received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: String,
    pub url: String,
    pub file_name: String,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store one file under `folder` and return where it can be fetched.
    async fn upload(
        &self,
        file: &FileUpload,
        folder: &str,
    ) -> Result<StoredDocument, DocumentStoreError>;
}

/// Object id: content digest prefix plus a random suffix so identical
/// files uploaded twice stay distinct.
fn object_id(bytes: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(bytes));
    format!("{}-{}", &digest[..16], Uuid::new_v4().simple())
}

/// Keep file names safe as a single path segment.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Extension for a declared content type, for names that arrive without one.
fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    match essence.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/heic" => Some("heic"),
        "application/pdf" => Some("pdf"),
        "text/plain" => Some("txt"),
        _ => None,
    }
}

/// Path segment an upload is stored under.
fn stored_name(file: &FileUpload) -> String {
    let name = sanitize_file_name(&file.file_name);
    if name.contains('.') {
        return name;
    }
    match extension_for(&file.content_type) {
        Some(ext) => format!("{name}.{ext}"),
        None => name,
    }
}

/// Local filesystem store
pub struct LocalDocumentStore {
    base_path: PathBuf,
}

impl LocalDocumentStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn upload(
        &self,
        file: &FileUpload,
        folder: &str,
    ) -> Result<StoredDocument, DocumentStoreError> {
        if file.bytes.is_empty() {
            return Err(DocumentStoreError::InvalidUpload(format!(
                "{} is empty",
                file.file_name
            )));
        }

        let id = object_id(&file.bytes);
        let dir = self.base_path.join(sanitize_file_name(folder)).join(&id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(stored_name(file));
        tokio::fs::write(&path, &file.bytes).await?;

        Ok(StoredDocument {
            id,
            url: format!("file://{}", path.display()),
            file_name: file.file_name.clone(),
        })
    }
}

/// In-memory store with failure and latency injection
#[derive(Default)]
pub struct MemoryDocumentStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    failing: RwLock<HashSet<String>>,
    delay: Option<Duration>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upload sleeps for `delay` before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Uploads of a file with this name fail with a storage error.
    pub async fn fail_on(&self, file_name: impl Into<String>) {
        self.failing.write().await.insert(file_name.into());
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn fetch(&self, url: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(url).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upload(
        &self,
        file: &FileUpload,
        folder: &str,
    ) -> Result<StoredDocument, DocumentStoreError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.read().await.contains(&file.file_name) {
            return Err(DocumentStoreError::Storage(format!(
                "rejected {}",
                file.file_name
            )));
        }

        let id = object_id(&file.bytes);
        let url = format!("memory://{}/{}/{}", folder, id, stored_name(file));
        self.objects
            .write()
            .await
            .insert(url.clone(), file.bytes.clone());

        Ok(StoredDocument {
            id,
            url,
            file_name: file.file_name.clone(),
        })
    }
}
