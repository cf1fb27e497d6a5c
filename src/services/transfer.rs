//! Drives one upload's chunk plan through the remote multipart protocol.

use crate::error::{RemoteError, RemoteErrorKind, Result, UploadError};
use crate::models::{ChunkPlan, ChunkRecord, ChunkStatus, CompletedPart, RemoteCompletion};
use crate::services::ledger::{ChunkLedger, MultipartInit, PlanRequest};
use crate::services::retry::{RetryError, RetryExecutor, RetryState};
use crate::services::storage::MultipartClient;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Progress notifications emitted while a transfer runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    ChunkStarted {
        upload_id: String,
        part_number: u32,
        attempt: u32,
    },
    ChunkRetry {
        upload_id: String,
        part_number: u32,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    ChunkCompleted {
        upload_id: String,
        part_number: u32,
        completed_chunks: u32,
        total_chunks: u32,
        uploaded_bytes: u64,
        total_bytes: u64,
    },
    RecoveryStarted {
        upload_id: String,
        reason: String,
    },
}

pub type EventSink<'a> = &'a (dyn Fn(TransferEvent) + Send + Sync);

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub completion: RemoteCompletion,
    pub plan: ChunkPlan,
    /// Retry diagnostics for each chunk uploaded in this run, by part number.
    pub chunk_history: BTreeMap<u32, RetryState>,
    pub recovered: bool,
}

/// Maps a failed completion onto the recovery taxonomy.
fn completion_error(err: RemoteError, upload_id: &str) -> UploadError {
    match err.kind {
        RemoteErrorKind::InvalidPart => UploadError::CompletionMismatch(err.message),
        RemoteErrorKind::NotFound => UploadError::UnrecoverableUpload(format!(
            "remote upload for {} no longer exists: {}",
            upload_id, err.message
        )),
        _ => UploadError::Remote(err),
    }
}

fn check_payload(plan: &ChunkPlan, payload: &Bytes) -> Result<()> {
    if payload.len() as u64 != plan.file_size {
        return Err(UploadError::SourceMismatch(format!(
            "payload is {} bytes, plan {} expects {}",
            payload.len(),
            plan.file_id,
            plan.file_size
        )));
    }
    Ok(())
}

pub struct TransferController {
    client: Arc<dyn MultipartClient>,
    ledger: Arc<ChunkLedger>,
    executor: RetryExecutor,
}

impl TransferController {
    pub fn new(
        client: Arc<dyn MultipartClient>,
        ledger: Arc<ChunkLedger>,
        executor: RetryExecutor,
    ) -> Self {
        Self {
            client,
            ledger,
            executor,
        }
    }

    pub fn ledger(&self) -> &Arc<ChunkLedger> {
        &self.ledger
    }

    /// Starts the remote multipart upload (with retries) and records its plan.
    pub async fn init_plan(&self, request: PlanRequest, chunk_size: u64) -> Result<ChunkPlan> {
        let client = self.client.clone();
        let executor = self.executor.clone();

        self.ledger
            .create_plan(request, chunk_size, |req| async move {
                executor
                    .execute_with_retry(
                        |_| {
                            client.create_multipart_upload(
                                &req.object_key,
                                &req.file_type,
                                &req.details.metadata,
                            )
                        },
                        |attempt| {
                            tracing::warn!(
                                "Multipart init for {} failed (attempt {}): {}",
                                req.file_id,
                                attempt.attempt,
                                attempt.error
                            );
                        },
                    )
                    .await
                    .map(|(init, _): (MultipartInit, _)| init)
                    .map_err(|e| e.last_error)
            })
            .await
    }

    /// Uploads every non-completed chunk of `upload_id` from `payload`, then
    /// completes the multipart upload, falling back to recovery when storage
    /// disagrees with the ledger.
    pub async fn run(
        &self,
        upload_id: &str,
        payload: &Bytes,
        cancel: &CancellationToken,
        on_event: EventSink<'_>,
    ) -> Result<TransferReport> {
        let plan = self.ledger.load_plan(upload_id).await?;

        if let Some(completion) = plan.completion.clone() {
            tracing::info!("♻️ Upload {} already completed remotely", upload_id);
            return Ok(TransferReport {
                completion,
                plan,
                chunk_history: BTreeMap::new(),
                recovered: false,
            });
        }

        check_payload(&plan, payload)?;

        tracing::info!(
            "🚀 Transferring {} ({}/{} chunks already stored)",
            upload_id,
            plan.completed_chunks,
            plan.total_chunks
        );

        let mut chunk_history = BTreeMap::new();
        let pending: Vec<ChunkRecord> = plan
            .chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .cloned()
            .collect();

        for chunk in pending {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let state = self
                .upload_chunk(upload_id, &plan.key, &chunk, payload, cancel, on_event)
                .await?;
            chunk_history.insert(chunk.part_number, state);
        }

        let plan = self.ledger.load_plan(upload_id).await?;
        let attempt = if plan.is_complete() {
            self.complete(&plan).await
        } else {
            Err(UploadError::CompletionMismatch(format!(
                "{} of {} chunks completed locally",
                plan.completed_chunks, plan.total_chunks
            )))
        };

        match attempt {
            Ok(completion) => {
                let plan = self
                    .ledger
                    .mark_remote_completed(upload_id, completion.clone())
                    .await?;
                tracing::info!("✅ Multipart upload {} completed", upload_id);
                Ok(TransferReport {
                    completion,
                    plan,
                    chunk_history,
                    recovered: false,
                })
            }
            Err(UploadError::CompletionMismatch(reason)) => {
                let mut report = self
                    .recover_with_reason(upload_id, Some(payload), cancel, on_event, reason)
                    .await?;
                for (part, state) in chunk_history {
                    report.chunk_history.entry(part).or_insert(state);
                }
                Ok(report)
            }
            Err(e) => Err(e),
        }
    }

    /// Reconciles the ledger with the storage service's part listing, uploads
    /// any part it is missing (only possible with `payload`), and completes once.
    pub async fn recover(
        &self,
        upload_id: &str,
        payload: Option<&Bytes>,
        cancel: &CancellationToken,
        on_event: EventSink<'_>,
    ) -> Result<TransferReport> {
        self.recover_with_reason(
            upload_id,
            payload,
            cancel,
            on_event,
            "recovery requested".to_string(),
        )
        .await
    }

    async fn recover_with_reason(
        &self,
        upload_id: &str,
        payload: Option<&Bytes>,
        cancel: &CancellationToken,
        on_event: EventSink<'_>,
        reason: String,
    ) -> Result<TransferReport> {
        tracing::warn!("🩹 Recovering upload {}: {}", upload_id, reason);
        on_event(TransferEvent::RecoveryStarted {
            upload_id: upload_id.to_string(),
            reason,
        });

        let plan = self.ledger.load_plan(upload_id).await?;
        if let Some(payload) = payload {
            check_payload(&plan, payload)?;
        }
        let (parts, _) = self
            .executor
            .execute_with_retry(
                |_| self.client.list_parts(&plan.key, &plan.upload_id),
                |_| {},
            )
            .await
            .map_err(|e: RetryError<RemoteError>| match e.last_error.kind {
                RemoteErrorKind::NotFound => UploadError::UnrecoverableUpload(format!(
                    "remote upload for {} no longer exists",
                    upload_id
                )),
                _ => UploadError::Remote(e.last_error),
            })?;

        if parts.is_empty() {
            return Err(UploadError::UnrecoverableUpload(format!(
                "storage holds no parts for {}",
                upload_id
            )));
        }

        let plan = self.ledger.rebuild_from_parts(upload_id, &parts).await?;
        let missing: Vec<ChunkRecord> = plan
            .chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .cloned()
            .collect();

        let mut chunk_history = BTreeMap::new();
        if !missing.is_empty() {
            let Some(payload) = payload else {
                return Err(UploadError::InvalidInput(format!(
                    "{} part(s) of {} are missing and no source is attached",
                    missing.len(),
                    upload_id
                )));
            };
            for chunk in missing {
                if cancel.is_cancelled() {
                    return Err(UploadError::Cancelled);
                }
                let state = self
                    .upload_chunk(upload_id, &plan.key, &chunk, payload, cancel, on_event)
                    .await?;
                chunk_history.insert(chunk.part_number, state);
            }
        }

        let plan = self.ledger.load_plan(upload_id).await?;
        let completion = self.complete(&plan).await?;
        let plan = self
            .ledger
            .mark_remote_completed(upload_id, completion.clone())
            .await?;

        tracing::info!("✅ Recovered and completed upload {}", upload_id);
        Ok(TransferReport {
            completion,
            plan,
            chunk_history,
            recovered: true,
        })
    }

    async fn complete(&self, plan: &ChunkPlan) -> Result<RemoteCompletion> {
        let parts: Vec<CompletedPart> = plan.completed_parts();
        self.executor
            .execute_with_retry(
                |_| {
                    self.client
                        .complete_multipart_upload(&plan.key, &plan.upload_id, &parts)
                },
                |attempt| {
                    tracing::warn!(
                        "Completing {} failed (attempt {}): {}",
                        plan.file_id,
                        attempt.attempt,
                        attempt.error
                    );
                },
            )
            .await
            .map(|(completion, _)| completion)
            .map_err(|e| completion_error(e.last_error, &plan.file_id))
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        key: &str,
        chunk: &ChunkRecord,
        payload: &Bytes,
        cancel: &CancellationToken,
        on_event: EventSink<'_>,
    ) -> Result<RetryState> {
        let prior = chunk.status;
        let part_number = chunk.part_number;
        let body = payload.slice(chunk.start as usize..chunk.end as usize);
        let remote_id = self.ledger.load_plan(upload_id).await?.upload_id;

        self.ledger
            .update_chunk(upload_id, chunk.index, ChunkStatus::Uploading, None)
            .await?;

        let attempts = self.executor.execute_with_retry(
            |attempt| {
                on_event(TransferEvent::ChunkStarted {
                    upload_id: upload_id.to_string(),
                    part_number,
                    attempt,
                });
                self.client
                    .upload_part(&remote_id, key, part_number, body.clone())
            },
            |retry| {
                on_event(TransferEvent::ChunkRetry {
                    upload_id: upload_id.to_string(),
                    part_number,
                    attempt: retry.attempt,
                    delay: retry.delay.unwrap_or_default(),
                    error: retry.error.clone(),
                });
            },
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = attempts => Some(result),
        };

        match outcome {
            None => {
                self.ledger
                    .update_chunk(upload_id, chunk.index, prior, None)
                    .await?;
                tracing::info!("⏹️ Part {} of {} cancelled", part_number, upload_id);
                Err(UploadError::Cancelled)
            }
            Some(Ok((etag, state))) => {
                let plan = self
                    .ledger
                    .update_chunk(upload_id, chunk.index, ChunkStatus::Completed, Some(etag))
                    .await?;
                tracing::debug!(
                    "Part {} of {} stored after {} attempt(s)",
                    part_number,
                    upload_id,
                    state.attempts
                );
                on_event(TransferEvent::ChunkCompleted {
                    upload_id: upload_id.to_string(),
                    part_number,
                    completed_chunks: plan.completed_chunks,
                    total_chunks: plan.total_chunks,
                    uploaded_bytes: plan.uploaded_bytes(),
                    total_bytes: plan.file_size,
                });
                Ok(state)
            }
            Some(Err(e)) => {
                self.ledger
                    .update_chunk(upload_id, chunk.index, ChunkStatus::Failed, None)
                    .await?;
                tracing::error!("❌ Part {} of {} failed: {}", part_number, upload_id, e);
                if e.last_error.kind == RemoteErrorKind::NotFound {
                    return Err(UploadError::UnrecoverableUpload(format!(
                        "remote upload for {} no longer exists: {}",
                        upload_id, e.last_error.message
                    )));
                }
                Err(UploadError::ChunkUpload {
                    part_number,
                    attempts: e.state.attempts,
                    source: e.last_error,
                })
            }
        }
    }
}
