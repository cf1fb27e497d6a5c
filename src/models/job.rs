use crate::models::plan::AssetDetails;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// The file a user picked. `data` is dropped after a reload and must be
/// re-attached before a resumable job can continue.
#[derive(Clone)]
pub struct SourceFile {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub data: Option<Bytes>,
}

impl std::fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .field("loaded", &self.data.is_some())
            .finish()
    }
}

impl SourceFile {
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            content_type: content_type.into(),
            data: Some(data),
        }
    }

    /// Reads a file from disk, guessing the content type from its magic bytes.
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let content_type = infer::get(&data)
            .map(|k| k.mime_type())
            .unwrap_or("application/octet-stream")
            .to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        Ok(Self::from_bytes(name, content_type, data))
    }

    /// Metadata-only handle, as restored from the ledger after a reload.
    pub fn detached(name: impl Into<String>, size: u64, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            content_type: content_type.into(),
            data: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }
}

/// One user-initiated transfer request.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: String,
    pub source: SourceFile,
    pub section: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub preview: bool,
    pub encrypt: bool,
    pub metadata: BTreeMap<String, String>,
}

impl UploadJob {
    pub fn new(source: SourceFile) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: source.name.clone(),
            source,
            section: None,
            description: None,
            preview: false,
            encrypt: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Registration fields persisted alongside the chunk plan.
    pub fn details(&self) -> AssetDetails {
        AssetDetails {
            title: self.title.clone(),
            description: self.description.clone(),
            section: self.section.clone(),
            preview: self.preview,
            metadata: self.metadata.clone(),
        }
    }

    /// Restores the fields saved by [`UploadJob::details`]. An empty title
    /// keeps the file name.
    pub fn with_details(mut self, details: AssetDetails) -> Self {
        if !details.title.is_empty() {
            self.title = details.title;
        }
        self.description = details.description;
        self.section = details.section;
        self.preview = details.preview;
        self.metadata = details.metadata;
        self
    }

    /// Object key used for the remote multipart upload.
    pub fn object_key(&self) -> String {
        let section = self.section.as_deref().unwrap_or("uncategorized");
        format!("uploads/{}/{}/{}", section, self.id, self.source.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Uploading,
    Paused,
    Completed,
    Failed,
}
