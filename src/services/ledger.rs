//! Durable record of every upload's chunk plan.
//!
//! The in-memory map and the [`LedgerStore`] are kept in step: every mutation
//! re-persists the whole plan before returning, so a reload never sees a
//! state older than the last acknowledged chunk.

use crate::error::{RemoteError, Result, UploadError};
use crate::models::{AssetDetails, ChunkPlan, ChunkRecord, ChunkStatus, CompletedPart, RemoteCompletion};
use crate::services::ledger_store::LedgerStore;
use crate::utils::chunking::split_ranges;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Version written by this crate. Records without a version are the legacy layout.
pub const PLAN_SCHEMA_VERSION: u32 = 2;

/// What the ledger needs to know to lay out a new plan.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub file_id: String,
    pub file_name: String,
    /// Bytes that will actually be transferred.
    pub file_size: u64,
    pub file_type: String,
    pub object_key: String,
    pub encrypted: bool,
    pub content_fingerprint: Option<String>,
    pub details: AssetDetails,
}

/// Identifiers returned by the remote multipart-init call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartInit {
    pub upload_id: String,
    pub key: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedPlan {
    schema_version: u32,
    #[serde(flatten)]
    plan: ChunkPlan,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPlan {
    file_id: String,
    file_name: String,
    file_size: u64,
    #[serde(default)]
    file_type: Option<String>,
    upload_id: String,
    key: String,
    chunks: Vec<LegacyChunk>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    last_updated: Option<i64>,
}

#[derive(Deserialize)]
struct LegacyChunk {
    index: u32,
    start: u64,
    end: u64,
    status: String,
    #[serde(default)]
    etag: Option<String>,
}

impl LegacyPlan {
    /// Fails when the record's chunk numbering cannot be carried over.
    fn migrate(self) -> std::result::Result<ChunkPlan, String> {
        let chunk_size = self
            .chunks
            .first()
            .map(|c| c.end.saturating_sub(c.start))
            .unwrap_or(self.file_size);

        let chunks = self
            .chunks
            .into_iter()
            .map(|c| {
                let part_number = c
                    .index
                    .checked_add(1)
                    .ok_or_else(|| format!("chunk index {} has no part number", c.index))?;
                let status = match (c.status.to_lowercase().as_str(), &c.etag) {
                    ("completed", Some(_)) => ChunkStatus::Completed,
                    ("failed" | "error", _) => ChunkStatus::Failed,
                    _ => ChunkStatus::Pending,
                };
                Ok(ChunkRecord {
                    index: c.index,
                    part_number,
                    start: c.start,
                    end: c.end,
                    etag: if status == ChunkStatus::Completed { c.etag } else { None },
                    status,
                    attempts: 0,
                })
            })
            .collect::<std::result::Result<Vec<_>, String>>()?;

        let mut plan = ChunkPlan {
            file_id: self.file_id,
            file_name: self.file_name,
            file_size: self.file_size,
            file_type: self
                .file_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            upload_id: self.upload_id,
            key: self.key,
            chunk_size,
            chunks,
            total_chunks: 0,
            completed_chunks: 0,
            encrypted: false,
            content_fingerprint: None,
            completion: None,
            details: AssetDetails::default(),
            last_updated: self
                .last_updated
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .unwrap_or_else(Utc::now),
        };
        plan.recount();
        Ok(plan)
    }
}

enum Decoded {
    Current(ChunkPlan),
    Migrated(ChunkPlan),
}

/// Parses a persisted record. `None` means "treat as absent".
fn decode_record(key: &str, raw: &str) -> Option<Decoded> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Ignoring unreadable ledger record {}: {}", key, e);
            return None;
        }
    };

    let decoded = match value.get("schemaVersion").and_then(Value::as_u64) {
        Some(v) if v == PLAN_SCHEMA_VERSION as u64 => {
            serde_json::from_value::<PersistedPlan>(value).map(|p| Decoded::Current(p.plan))
        }
        Some(other) => {
            tracing::warn!(
                "Ignoring ledger record {} with unknown schema version {}",
                key,
                other
            );
            return None;
        }
        None => match serde_json::from_value::<LegacyPlan>(value) {
            Ok(legacy) => match legacy.migrate() {
                Ok(plan) => Ok(Decoded::Migrated(plan)),
                Err(reason) => {
                    tracing::warn!("Ignoring unmigratable ledger record {}: {}", key, reason);
                    return None;
                }
            },
            Err(e) => Err(e),
        },
    };

    let decoded = match decoded {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("Ignoring malformed ledger record {}: {}", key, e);
            return None;
        }
    };

    let plan = match &decoded {
        Decoded::Current(p) | Decoded::Migrated(p) => p,
    };
    if let Err(reason) = plan.validate() {
        tracing::warn!("Ignoring inconsistent ledger record {}: {}", key, reason);
        return None;
    }
    Some(decoded)
}

fn check_transition(chunk: &ChunkRecord, to: ChunkStatus, tag: Option<&str>) -> Result<bool> {
    let invalid = || UploadError::InvalidTransition {
        part_number: chunk.part_number,
        from: chunk.status.to_string(),
        to: to.to_string(),
    };

    match (chunk.status, to) {
        (ChunkStatus::Completed, ChunkStatus::Completed) => {
            if tag.is_none() || tag == chunk.etag.as_deref() {
                Ok(false)
            } else {
                Err(invalid())
            }
        }
        (ChunkStatus::Completed, _) => Err(invalid()),
        (from, to) if from == to => Ok(false),
        (ChunkStatus::Uploading, ChunkStatus::Completed) if tag.is_none() => {
            Err(UploadError::InvalidInput(format!(
                "part {} cannot complete without a tag",
                chunk.part_number
            )))
        }
        (ChunkStatus::Pending | ChunkStatus::Failed, ChunkStatus::Uploading)
        | (
            ChunkStatus::Uploading,
            ChunkStatus::Completed | ChunkStatus::Failed | ChunkStatus::Pending,
        ) => Ok(true),
        _ => Err(invalid()),
    }
}

pub struct ChunkLedger {
    store: Arc<dyn LedgerStore>,
    prefix: String,
    plans: Mutex<HashMap<String, ChunkPlan>>,
}

impl ChunkLedger {
    pub fn new(store: Arc<dyn LedgerStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            plans: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_for(&self, upload_id: &str) -> String {
        format!("{}{}", self.prefix, upload_id)
    }

    async fn persist(&self, plan: &ChunkPlan) -> Result<()> {
        let record = PersistedPlan {
            schema_version: PLAN_SCHEMA_VERSION,
            plan: plan.clone(),
        };
        let json = serde_json::to_string(&record)?;
        self.store.put(&self.key_for(&plan.file_id), &json).await
    }

    /// Lays out `ceil(file_size / chunk_size)` pending chunks around a fresh
    /// remote multipart upload and persists the plan.
    pub async fn create_plan<F, Fut>(
        &self,
        request: PlanRequest,
        chunk_size: u64,
        remote_init: F,
    ) -> Result<ChunkPlan>
    where
        F: FnOnce(PlanRequest) -> Fut,
        Fut: Future<Output = std::result::Result<MultipartInit, RemoteError>>,
    {
        if request.file_size == 0 {
            return Err(UploadError::InvalidInput(format!(
                "{} is empty; a multipart upload needs at least one byte",
                request.file_name
            )));
        }
        if chunk_size == 0 {
            return Err(UploadError::InvalidInput("chunk size must be positive".into()));
        }

        let file_id = request.file_id.clone();
        let file_name = request.file_name.clone();
        let file_size = request.file_size;
        let file_type = request.file_type.clone();
        let encrypted = request.encrypted;
        let content_fingerprint = request.content_fingerprint.clone();
        let details = request.details.clone();

        let init = remote_init(request)
            .await
            .map_err(UploadError::Initialization)?;

        let mut plan = ChunkPlan {
            file_id,
            file_name,
            file_size,
            file_type,
            upload_id: init.upload_id,
            key: init.key,
            chunk_size,
            chunks: split_ranges(file_size, chunk_size),
            total_chunks: 0,
            completed_chunks: 0,
            encrypted,
            content_fingerprint,
            completion: None,
            details,
            last_updated: Utc::now(),
        };
        plan.recount();

        let mut plans = self.plans.lock().await;
        self.persist(&plan).await?;
        plans.insert(plan.file_id.clone(), plan.clone());

        tracing::info!(
            "📋 Planned upload {} ({} bytes, {} chunks of {} bytes, remote id {})",
            plan.file_id,
            plan.file_size,
            plan.total_chunks,
            plan.chunk_size,
            plan.upload_id
        );
        Ok(plan)
    }

    async fn load_locked(
        &self,
        plans: &mut HashMap<String, ChunkPlan>,
        upload_id: &str,
    ) -> Result<ChunkPlan> {
        if let Some(plan) = plans.get(upload_id) {
            return Ok(plan.clone());
        }

        let key = self.key_for(upload_id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("no chunk plan for {}", upload_id)))?;

        let (mut plan, mut dirty) = match decode_record(&key, &raw) {
            Some(Decoded::Current(p)) => (p, false),
            Some(Decoded::Migrated(p)) => {
                tracing::info!("🔄 Migrated legacy ledger record {}", key);
                (p, true)
            }
            None => {
                return Err(UploadError::NotFound(format!(
                    "no usable chunk plan for {}",
                    upload_id
                )));
            }
        };

        // A chunk caught mid-flight by a crash never got an answer.
        for chunk in plan.chunks.iter_mut() {
            if chunk.status == ChunkStatus::Uploading {
                chunk.status = ChunkStatus::Pending;
                dirty = true;
            }
        }
        if dirty {
            plan.last_updated = Utc::now();
            self.persist(&plan).await?;
        }

        plans.insert(upload_id.to_string(), plan.clone());
        Ok(plan)
    }

    /// Memory first, then the durable store.
    pub async fn load_plan(&self, upload_id: &str) -> Result<ChunkPlan> {
        let mut plans = self.plans.lock().await;
        self.load_locked(&mut plans, upload_id).await
    }

    /// The only mutation path for a single chunk.
    pub async fn update_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        status: ChunkStatus,
        tag: Option<String>,
    ) -> Result<ChunkPlan> {
        let mut plans = self.plans.lock().await;
        let mut plan = self.load_locked(&mut plans, upload_id).await?;

        let chunk = plan
            .chunks
            .get_mut(chunk_index as usize)
            .ok_or_else(|| {
                UploadError::InvalidInput(format!(
                    "chunk index {} out of range for {}",
                    chunk_index, upload_id
                ))
            })?;

        if !check_transition(chunk, status, tag.as_deref())? {
            return Ok(plan);
        }

        if status == ChunkStatus::Uploading {
            chunk.attempts += 1;
        }
        chunk.etag = if status == ChunkStatus::Completed { tag } else { None };
        chunk.status = status;

        plan.recount();
        plan.last_updated = Utc::now();
        self.persist(&plan).await?;
        plans.insert(upload_id.to_string(), plan.clone());
        Ok(plan)
    }

    /// Replaces local progress with the storage service's part listing:
    /// every reported part becomes `Completed` with the server's tag, the
    /// rest go back to `Pending`.
    pub async fn rebuild_from_parts(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ChunkPlan> {
        let mut plans = self.plans.lock().await;
        let mut plan = self.load_locked(&mut plans, upload_id).await?;

        let reported: HashMap<u32, &str> = parts
            .iter()
            .map(|p| (p.part_number, p.etag.as_str()))
            .collect();

        for chunk in plan.chunks.iter_mut() {
            match reported.get(&chunk.part_number) {
                Some(etag) => {
                    chunk.status = ChunkStatus::Completed;
                    chunk.etag = Some(etag.to_string());
                }
                None => {
                    chunk.status = ChunkStatus::Pending;
                    chunk.etag = None;
                }
            }
        }

        let unknown = reported
            .keys()
            .filter(|n| **n == 0 || **n > plan.total_chunks)
            .count();
        if unknown > 0 {
            tracing::warn!(
                "Storage reports {} part(s) outside the plan for {}; ignoring them",
                unknown,
                upload_id
            );
        }

        plan.recount();
        plan.last_updated = Utc::now();
        self.persist(&plan).await?;
        plans.insert(upload_id.to_string(), plan.clone());

        tracing::info!(
            "🩹 Rebuilt plan {} from storage: {}/{} parts present",
            upload_id,
            plan.completed_chunks,
            plan.total_chunks
        );
        Ok(plan)
    }

    /// Records that the remote object exists, so registration can be retried
    /// later without re-uploading.
    pub async fn mark_remote_completed(
        &self,
        upload_id: &str,
        completion: RemoteCompletion,
    ) -> Result<ChunkPlan> {
        let mut plans = self.plans.lock().await;
        let mut plan = self.load_locked(&mut plans, upload_id).await?;
        plan.completion = Some(completion);
        plan.last_updated = Utc::now();
        self.persist(&plan).await?;
        plans.insert(upload_id.to_string(), plan.clone());
        Ok(plan)
    }

    /// Drops the plan from memory and durable storage.
    pub async fn discard(&self, upload_id: &str) -> Result<()> {
        let mut plans = self.plans.lock().await;
        plans.remove(upload_id);
        self.store.delete(&self.key_for(upload_id)).await?;
        tracing::debug!("🗑️ Discarded ledger entry {}", upload_id);
        Ok(())
    }

    /// Every usable plan in the durable store, for crash recovery.
    pub async fn list_persisted(&self) -> Result<Vec<ChunkPlan>> {
        let rows = self.store.list(&self.prefix).await?;
        let mut result = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            let Some(upload_id) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            match self.load_plan(upload_id).await {
                Ok(plan) => result.push(plan),
                Err(UploadError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }
}
