use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Uploading => "uploading",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub index: u32,
    pub part_number: u32,
    /// Inclusive start offset.
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
    pub status: ChunkStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ChunkRecord {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A part as reported to, or by, the storage service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Result of a successful "complete multipart upload".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCompletion {
    pub location: String,
    pub etag: String,
}

/// Registration fields of an upload. None of them are secret, so they are
/// persisted with the plan and survive a reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDetails {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default)]
    pub preview: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Chunk layout and progress of one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPlan {
    pub file_id: String,
    pub file_name: String,
    /// Size of the transferred payload (ciphertext when encrypted).
    pub file_size: u64,
    pub file_type: String,
    pub upload_id: String,
    pub key: String,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkRecord>,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub encrypted: bool,
    /// SHA-256 of the source file, used to validate a re-attached file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<RemoteCompletion>,
    #[serde(default)]
    pub details: AssetDetails,
    pub last_updated: DateTime<Utc>,
}

impl ChunkPlan {
    pub fn recount(&mut self) {
        self.total_chunks = self.chunks.len() as u32;
        self.completed_chunks = self
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count() as u32;
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.completed_chunks == self.total_chunks
    }

    pub fn first_incomplete(&self) -> Option<&ChunkRecord> {
        self.chunks
            .iter()
            .find(|c| c.status != ChunkStatus::Completed)
    }

    /// `{partNumber, etag}` for every completed chunk, sorted by part number.
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        let mut parts: Vec<CompletedPart> = self
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .filter_map(|c| {
                c.etag.as_ref().map(|etag| CompletedPart {
                    part_number: c.part_number,
                    etag: etag.clone(),
                })
            })
            .collect();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .map(ChunkRecord::len)
            .sum()
    }

    /// Checks the structural invariants; returns a description of the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.total_chunks as usize != self.chunks.len() {
            return Err(format!(
                "totalChunks {} != {} chunk records",
                self.total_chunks,
                self.chunks.len()
            ));
        }
        let completed = self
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count() as u32;
        if completed != self.completed_chunks {
            return Err(format!(
                "completedChunks {} != {} completed records",
                self.completed_chunks, completed
            ));
        }

        let mut expected_start = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let numbered = chunk.index.checked_add(1) == Some(chunk.part_number);
            if chunk.index as usize != i || !numbered {
                return Err(format!("chunk {} has inconsistent numbering", i));
            }
            if chunk.start != expected_start || chunk.end <= chunk.start {
                return Err(format!(
                    "chunk {} range [{}, {}) is not contiguous",
                    i, chunk.start, chunk.end
                ));
            }
            if chunk.status == ChunkStatus::Completed && chunk.etag.is_none() {
                return Err(format!("chunk {} is completed without a tag", i));
            }
            expected_start = chunk.end;
        }
        if expected_start != self.file_size {
            return Err(format!(
                "chunks cover [0, {}) but file size is {}",
                expected_start, self.file_size
            ));
        }
        Ok(())
    }
}
