//! Background upload queue: admits one job at a time, survives reloads by
//! rehydrating from the ledger, and finalizes finished objects.

use crate::config::UploadConfig;
use crate::error::{FailureCategory, Result, UploadError};
use crate::models::{ChunkPlan, JobStatus, SourceFile, UploadJob};
use crate::services::encryption::{EncryptionMaterial, EncryptionPipeline};
use crate::services::ledger::{ChunkLedger, PlanRequest};
use crate::services::registrar::{Finalizer, RegisteredEntity, RegistrationRequest};
use crate::services::retry::RetryExecutor;
use crate::services::storage::MultipartClient;
use crate::services::transfer::{TransferController, TransferEvent};
use crate::utils::chunking::ChunkingPolicy;
use crate::utils::hash;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
}

impl JobProgress {
    fn from_plan(plan: &ChunkPlan) -> Self {
        Self {
            completed_chunks: plan.completed_chunks,
            total_chunks: plan.total_chunks,
            uploaded_bytes: plan.uploaded_bytes(),
            total_bytes: plan.file_size,
        }
    }

    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.uploaded_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Broadcast to every subscriber; slow receivers may lag and skip events.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    StatusChanged {
        job_id: String,
        status: JobStatus,
    },
    Progress {
        job_id: String,
        progress: JobProgress,
    },
    ChunkRetry {
        job_id: String,
        part_number: u32,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Warning {
        job_id: String,
        message: String,
    },
    Completed {
        job_id: String,
        entity: RegisteredEntity,
    },
    Failed {
        job_id: String,
        category: FailureCategory,
        message: String,
    },
    Cancelled {
        job_id: String,
    },
}

/// Point-in-time view of one job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: String,
    pub title: String,
    pub file_name: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub encrypted: bool,
    pub source_attached: bool,
    pub error: Option<String>,
    pub category: Option<FailureCategory>,
    pub warnings: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// Bytes actually sent to storage, kept so a retry in the same session
/// resumes against identical ciphertext.
#[derive(Clone)]
struct PreparedPayload {
    data: Bytes,
    material: Option<EncryptionMaterial>,
    fingerprint: String,
}

struct JobEntry {
    job: UploadJob,
    status: JobStatus,
    progress: JobProgress,
    prepared: Option<PreparedPayload>,
    cancel: Option<CancellationToken>,
    cancel_requested: bool,
    abandon_requested: bool,
    restarted: bool,
    error: Option<String>,
    category: Option<FailureCategory>,
    warnings: Vec<String>,
    enqueued_at: DateTime<Utc>,
}

impl JobEntry {
    fn new(job: UploadJob, status: JobStatus) -> Self {
        Self {
            job,
            status,
            progress: JobProgress::default(),
            prepared: None,
            cancel: None,
            cancel_requested: false,
            abandon_requested: false,
            restarted: false,
            error: None,
            category: None,
            warnings: Vec::new(),
            enqueued_at: Utc::now(),
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.job.id.clone(),
            title: self.job.title.clone(),
            file_name: self.job.source.name.clone(),
            status: self.status,
            progress: self.progress,
            encrypted: self
                .prepared
                .as_ref()
                .map(|p| p.material.is_some())
                .unwrap_or(self.job.encrypt),
            source_attached: self.job.source.is_loaded(),
            error: self.error.clone(),
            category: self.category,
            warnings: self.warnings.clone(),
            enqueued_at: self.enqueued_at,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, JobEntry>,
    order: Vec<String>,
}

impl SchedulerState {
    fn insert(&mut self, entry: JobEntry) {
        self.order.push(entry.job.id.clone());
        self.jobs.insert(entry.job.id.clone(), entry);
    }

    fn remove(&mut self, job_id: &str) -> Option<JobEntry> {
        self.order.retain(|id| id != job_id);
        self.jobs.remove(job_id)
    }

    fn active(&self) -> Option<&JobEntry> {
        self.jobs
            .values()
            .find(|e| e.status == JobStatus::Uploading)
    }

    fn next_queued(&self) -> Option<String> {
        self.order
            .iter()
            .find(|id| {
                self.jobs
                    .get(*id)
                    .is_some_and(|e| e.status == JobStatus::Queued)
            })
            .cloned()
    }
}

enum Outcome {
    Completed(RegisteredEntity),
    Paused,
}

struct Inner {
    config: UploadConfig,
    ledger: Arc<ChunkLedger>,
    client: Arc<dyn MultipartClient>,
    transfer: TransferController,
    finalizer: Arc<dyn Finalizer>,
    finalize_executor: RetryExecutor,
    pipeline: EncryptionPipeline,
    chunking: ChunkingPolicy,
    state: Mutex<SchedulerState>,
    admission: Semaphore,
    wake: Notify,
    stopping: AtomicBool,
    events: broadcast::Sender<UploadEvent>,
}

async fn fingerprint(data: Bytes) -> Result<String> {
    tokio::task::spawn_blocking(move || hash::fingerprint(&data))
        .await
        .map_err(|e| UploadError::InvalidInput(format!("hashing task failed: {}", e)))
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: UploadEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_status(&self, job_id: &str, status: JobStatus) {
        if let Some(entry) = self.state().jobs.get_mut(job_id) {
            entry.status = status;
        }
        self.emit(UploadEvent::StatusChanged {
            job_id: job_id.to_string(),
            status,
        });
    }

    fn warn(&self, job_id: &str, message: String) {
        tracing::warn!("⚠️ {}: {}", job_id, message);
        if let Some(entry) = self.state().jobs.get_mut(job_id) {
            entry.warnings.push(message.clone());
        }
        self.emit(UploadEvent::Warning {
            job_id: job_id.to_string(),
            message,
        });
    }

    fn on_transfer_event(&self, job_id: &str, event: TransferEvent) {
        match event {
            TransferEvent::ChunkStarted {
                part_number,
                attempt,
                ..
            } => {
                tracing::debug!("{} part {} attempt {}", job_id, part_number, attempt);
            }
            TransferEvent::ChunkRetry {
                part_number,
                attempt,
                delay,
                error,
                ..
            } => self.emit(UploadEvent::ChunkRetry {
                job_id: job_id.to_string(),
                part_number,
                attempt,
                delay,
                error,
            }),
            TransferEvent::ChunkCompleted {
                completed_chunks,
                total_chunks,
                uploaded_bytes,
                total_bytes,
                ..
            } => {
                let progress = JobProgress {
                    completed_chunks,
                    total_chunks,
                    uploaded_bytes,
                    total_bytes,
                };
                if let Some(entry) = self.state().jobs.get_mut(job_id) {
                    entry.progress = progress;
                }
                self.emit(UploadEvent::Progress {
                    job_id: job_id.to_string(),
                    progress,
                });
            }
            TransferEvent::RecoveryStarted { reason, .. } => {
                self.warn(job_id, format!("recovering upload: {}", reason));
            }
        }
    }

    fn record_progress(&self, job_id: &str, plan: &ChunkPlan) {
        let progress = JobProgress::from_plan(plan);
        if let Some(entry) = self.state().jobs.get_mut(job_id) {
            entry.progress = progress;
        }
        self.emit(UploadEvent::Progress {
            job_id: job_id.to_string(),
            progress,
        });
    }

    /// Marks the head of the queue as uploading.
    fn admit_next(&self) -> Option<(String, CancellationToken)> {
        let mut state = self.state();
        if state.active().is_some() {
            return None;
        }
        let job_id = state.next_queued()?;
        let entry = state.jobs.get_mut(&job_id)?;
        let token = CancellationToken::new();
        entry.status = JobStatus::Uploading;
        entry.cancel = Some(token.clone());
        entry.cancel_requested = false;
        entry.error = None;
        entry.category = None;
        drop(state);

        self.emit(UploadEvent::StatusChanged {
            job_id: job_id.clone(),
            status: JobStatus::Uploading,
        });
        Some((job_id, token))
    }

    /// Plans left behind by an earlier process come back as jobs. Only an
    /// unencrypted, remotely completed plan can proceed without its source.
    async fn rehydrate(&self) -> Result<usize> {
        let plans = self.ledger.list_persisted().await?;
        let mut restored = 0;

        for plan in plans {
            let status = if plan.completion.is_some() && !plan.encrypted {
                JobStatus::Queued
            } else {
                JobStatus::Paused
            };

            let mut job = UploadJob::new(SourceFile::detached(
                plan.file_name.clone(),
                plan.file_size,
                plan.file_type.clone(),
            ))
            .with_details(plan.details.clone());
            job.id = plan.file_id.clone();
            job.encrypt = plan.encrypted;

            let mut state = self.state();
            if state.jobs.contains_key(&job.id) {
                continue;
            }
            let mut entry = JobEntry::new(job, status);
            entry.progress = JobProgress::from_plan(&plan);
            state.insert(entry);
            drop(state);

            tracing::info!(
                "🔄 Restored upload {} as {:?} ({}/{} chunks)",
                plan.file_id,
                status,
                plan.completed_chunks,
                plan.total_chunks
            );
            self.emit(UploadEvent::StatusChanged {
                job_id: plan.file_id.clone(),
                status,
            });
            restored += 1;
        }

        if restored > 0 {
            self.wake.notify_one();
        }
        Ok(restored)
    }

    async fn prepare(&self, job: &UploadJob, data: Bytes) -> Result<PreparedPayload> {
        let fingerprint = fingerprint(data.clone()).await?;

        let prepared = if job.encrypt {
            match self.pipeline.encrypt_in_background(data.clone()).await {
                Ok(encrypted) => PreparedPayload {
                    data: encrypted.ciphertext,
                    material: Some(encrypted.material),
                    fingerprint,
                },
                Err(e) => {
                    self.warn(
                        &job.id,
                        format!("{}; uploading without encryption", e),
                    );
                    PreparedPayload {
                        data,
                        material: None,
                        fingerprint,
                    }
                }
            }
        } else {
            PreparedPayload {
                data,
                material: None,
                fingerprint,
            }
        };

        if let Some(entry) = self.state().jobs.get_mut(&job.id) {
            entry.prepared = Some(prepared.clone());
        }
        Ok(prepared)
    }

    /// The key for an encrypted plan from an earlier process is gone, so its
    /// remote upload is useless.
    async fn drop_stale_plan(&self, plan: &ChunkPlan) -> Result<()> {
        if plan.completion.is_none() {
            if let Err(e) = self
                .client
                .abort_multipart_upload(&plan.key, &plan.upload_id)
                .await
            {
                tracing::warn!("Failed to abort stale upload {}: {}", plan.upload_id, e);
            }
        } else {
            tracing::warn!(
                "Object {} was stored under a lost key and is left for cleanup",
                plan.key
            );
        }
        self.ledger.discard(&plan.file_id).await
    }

    async fn process(&self, job_id: &str, cancel: &CancellationToken) -> Result<Outcome> {
        let (job, prepared) = {
            let state = self.state();
            let entry = state
                .jobs
                .get(job_id)
                .ok_or_else(|| UploadError::NotFound(format!("job {}", job_id)))?;
            (entry.job.clone(), entry.prepared.clone())
        };

        let mut existing = match self.ledger.load_plan(job_id).await {
            Ok(plan) => Some(plan),
            Err(UploadError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let has_key = prepared.as_ref().is_some_and(|p| p.material.is_some());
        if let Some(plan) = existing.as_ref().filter(|p| p.encrypted && !has_key) {
            if !job.source.is_loaded() {
                return Ok(Outcome::Paused);
            }
            self.warn(
                job_id,
                "encryption key was lost with the previous session; restarting upload".into(),
            );
            self.drop_stale_plan(plan).await?;
            existing = None;
        }

        if let Some(plan) = existing.as_ref().filter(|p| p.completion.is_some()) {
            let material = prepared.as_ref().and_then(|p| p.material.as_ref());
            let entity = self.finalize(&job, plan, material).await?;
            return Ok(Outcome::Completed(entity));
        }

        let prepared = match prepared {
            Some(p) => p,
            None => {
                let Some(data) = job.source.data.clone() else {
                    return Ok(Outcome::Paused);
                };
                self.prepare(&job, data).await?
            }
        };
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let plan = match existing {
            Some(plan) => plan,
            None => {
                let request = PlanRequest {
                    file_id: job.id.clone(),
                    file_name: job.source.name.clone(),
                    file_size: prepared.data.len() as u64,
                    file_type: job.source.content_type.clone(),
                    object_key: job.object_key(),
                    encrypted: prepared.material.is_some(),
                    content_fingerprint: Some(prepared.fingerprint.clone()),
                    details: job.details(),
                };
                let chunk_size = self.chunking.chunk_size_for(request.file_size);
                self.transfer.init_plan(request, chunk_size).await?
            }
        };
        self.record_progress(job_id, &plan);
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let sink = |event: TransferEvent| self.on_transfer_event(job_id, event);
        let report = self
            .transfer
            .run(job_id, &prepared.data, cancel, &sink)
            .await?;
        self.record_progress(job_id, &report.plan);

        let entity = self
            .finalize(&job, &report.plan, prepared.material.as_ref())
            .await?;
        Ok(Outcome::Completed(entity))
    }

    /// Registers the stored object; the ledger entry is only discarded once
    /// registration succeeds.
    async fn finalize(
        &self,
        job: &UploadJob,
        plan: &ChunkPlan,
        material: Option<&EncryptionMaterial>,
    ) -> Result<RegisteredEntity> {
        let completion = plan.completion.clone().ok_or_else(|| {
            UploadError::CompletionMismatch(format!("{} has no remote completion", plan.file_id))
        })?;

        let request = RegistrationRequest {
            upload_job_id: job.id.clone(),
            title: job.title.clone(),
            description: job.description.clone(),
            section: job.section.clone(),
            preview: job.preview,
            file_name: plan.file_name.clone(),
            file_size: plan.file_size,
            content_type: plan.file_type.clone(),
            object_key: plan.key.clone(),
            location: completion.location,
            etag: completion.etag,
            is_encrypted: material.is_some(),
            encryption_key: material.map(|m| m.key_hex()),
            encryption_iv: material.map(|m| m.iv_hex()),
            encryption_algorithm: material.map(|m| m.algorithm.to_string()),
            checksum: plan.content_fingerprint.clone(),
            metadata: job.metadata.clone(),
        };

        let (entity, _) = self
            .finalize_executor
            .execute_with_retry(
                |_| self.finalizer.register(&request),
                |attempt| {
                    tracing::warn!(
                        "Registration of {} failed (attempt {}): {}",
                        job.id,
                        attempt.attempt,
                        attempt.error
                    );
                },
            )
            .await
            .map_err(|e| UploadError::Finalization(e.last_error))?;

        self.ledger.discard(&job.id).await?;
        Ok(entity)
    }

    async fn abort_and_discard(&self, job_id: &str) {
        match self.ledger.load_plan(job_id).await {
            Ok(plan) => {
                if plan.completion.is_none() {
                    if let Err(e) = self
                        .client
                        .abort_multipart_upload(&plan.key, &plan.upload_id)
                        .await
                    {
                        tracing::warn!("Failed to abort upload {}: {}", plan.upload_id, e);
                    }
                }
                if let Err(e) = self.ledger.discard(job_id).await {
                    tracing::error!("Failed to discard ledger for {}: {}", job_id, e);
                }
            }
            Err(UploadError::NotFound(_)) => {}
            Err(e) => tracing::error!("Failed to load ledger for {}: {}", job_id, e),
        }
    }

    async fn settle(&self, job_id: &str, result: Result<Outcome>) {
        match result {
            Ok(Outcome::Completed(entity)) => {
                // Finished jobs leave the table, payload included.
                self.state().remove(job_id);
                tracing::info!("✅ Upload {} registered as {}", job_id, entity.id);
                self.emit(UploadEvent::StatusChanged {
                    job_id: job_id.to_string(),
                    status: JobStatus::Completed,
                });
                self.emit(UploadEvent::Completed {
                    job_id: job_id.to_string(),
                    entity,
                });
            }
            Ok(Outcome::Paused) => {
                tracing::info!("⏸️ Upload {} is waiting for its source file", job_id);
                self.set_status(job_id, JobStatus::Paused);
            }
            Err(UploadError::Cancelled) => {
                let (requested, abandon) = {
                    let mut state = self.state();
                    match state.jobs.get_mut(job_id) {
                        Some(entry) => {
                            entry.cancel = None;
                            (entry.cancel_requested, entry.abandon_requested)
                        }
                        None => (true, false),
                    }
                };

                if !requested && self.stopping.load(Ordering::SeqCst) {
                    tracing::info!("⏹️ Upload {} interrupted by shutdown", job_id);
                    self.set_status(job_id, JobStatus::Queued);
                    return;
                }
                if abandon {
                    self.abort_and_discard(job_id).await;
                }
                self.state().remove(job_id);
                tracing::info!("⏹️ Upload {} cancelled", job_id);
                self.emit(UploadEvent::Cancelled {
                    job_id: job_id.to_string(),
                });
            }
            Err(UploadError::UnrecoverableUpload(reason)) => {
                if let Err(e) = self.ledger.discard(job_id).await {
                    tracing::error!("Failed to discard ledger for {}: {}", job_id, e);
                }
                let restart = {
                    let mut state = self.state();
                    match state.jobs.get_mut(job_id) {
                        Some(entry) if self.config.auto_restart_unrecoverable && !entry.restarted => {
                            entry.restarted = true;
                            entry.progress = JobProgress::default();
                            true
                        }
                        _ => false,
                    }
                };
                if restart {
                    self.warn(job_id, format!("{}; restarting from scratch", reason));
                    self.set_status(job_id, JobStatus::Queued);
                } else {
                    self.fail(job_id, UploadError::UnrecoverableUpload(reason));
                }
            }
            Err(e) => self.fail(job_id, e),
        }
    }

    fn fail(&self, job_id: &str, error: UploadError) {
        let category = error.category();
        tracing::error!("❌ Upload {} failed: {}", job_id, error);
        if let Some(entry) = self.state().jobs.get_mut(job_id) {
            entry.status = JobStatus::Failed;
            entry.cancel = None;
            entry.error = Some(error.to_string());
            entry.category = Some(category);
        }
        self.emit(UploadEvent::StatusChanged {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
        });
        self.emit(UploadEvent::Failed {
            job_id: job_id.to_string(),
            category,
            message: category.user_message().to_string(),
        });
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("🚀 Upload scheduler started");

        match self.rehydrate().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("📋 Rehydrated {} upload(s) from the ledger", n),
            Err(e) => tracing::error!("Failed to rehydrate ledger: {}", e),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = match self.admission.acquire().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let Some((job_id, cancel)) = self.admit_next() else {
                drop(permit);
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.wake.notified() => {}
                }
                continue;
            };

            let job = self.process(&job_id, &cancel);
            tokio::pin!(job);
            let result = tokio::select! {
                result = &mut job => result,
                _ = shutdown.changed() => {
                    self.stopping.store(true, Ordering::SeqCst);
                    cancel.cancel();
                    job.await
                }
            };
            self.settle(&job_id, result).await;
            drop(permit);
        }

        tracing::info!("🛑 Upload scheduler shutting down");
    }
}

/// Owns the job table and the single worker task.
pub struct UploadScheduler {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UploadScheduler {
    pub fn new(
        config: UploadConfig,
        ledger: Arc<ChunkLedger>,
        client: Arc<dyn MultipartClient>,
        finalizer: Arc<dyn Finalizer>,
    ) -> Self {
        Self::with_pipeline(config, ledger, client, finalizer, EncryptionPipeline::default())
    }

    /// Like [`UploadScheduler::new`], encrypting new uploads with `pipeline`.
    pub fn with_pipeline(
        config: UploadConfig,
        ledger: Arc<ChunkLedger>,
        client: Arc<dyn MultipartClient>,
        finalizer: Arc<dyn Finalizer>,
        pipeline: EncryptionPipeline,
    ) -> Self {
        let transfer = TransferController::new(
            client.clone(),
            ledger.clone(),
            RetryExecutor::new(config.chunk_backoff()),
        );
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let inner = Inner {
            finalize_executor: RetryExecutor::new(config.finalize_backoff()),
            chunking: ChunkingPolicy::from_config(&config),
            pipeline,
            config,
            ledger,
            client,
            transfer,
            finalizer,
            state: Mutex::new(SchedulerState::default()),
            admission: Semaphore::new(1),
            wake: Notify::new(),
            stopping: AtomicBool::new(false),
            events,
        };

        Self {
            inner: Arc::new(inner),
            shutdown,
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns the worker. Persisted plans come back as jobs before the first
    /// admission. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(false);

        let inner = self.inner.clone();
        let rx = self.shutdown.subscribe();
        *worker = Some(tokio::spawn(inner.run(rx)));
    }

    /// Signals the worker and waits for it. An interrupted job goes back to
    /// `Queued` with its ledger intact.
    pub async fn stop(&self) {
        let handle = self.worker().take();
        let Some(handle) = handle else {
            return;
        };
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        if let Err(e) = handle.await {
            tracing::error!("Upload scheduler task failed: {}", e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub fn enqueue(&self, job: UploadJob) -> Result<String> {
        if !job.source.is_loaded() {
            return Err(UploadError::InvalidInput(format!(
                "{} has no data attached",
                job.source.name
            )));
        }
        if job.source.size == 0 {
            return Err(UploadError::InvalidInput(format!(
                "{} is empty",
                job.source.name
            )));
        }

        let job_id = job.id.clone();
        {
            let mut state = self.inner.state();
            if state.jobs.contains_key(&job_id) {
                return Err(UploadError::InvalidInput(format!(
                    "job {} is already queued",
                    job_id
                )));
            }
            tracing::info!(
                "📥 Queued {} ({} bytes, encrypt={})",
                job.source.name,
                job.source.size,
                job.encrypt
            );
            state.insert(JobEntry::new(job, JobStatus::Queued));
        }

        self.inner.emit(UploadEvent::StatusChanged {
            job_id: job_id.clone(),
            status: JobStatus::Queued,
        });
        self.inner.wake.notify_one();
        Ok(job_id)
    }

    /// Stops an active job after its in-flight chunk is reverted, or drops an
    /// idle one. The ledger entry is kept.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        self.request_cancel(job_id, false).map(|_| ())
    }

    fn request_cancel(&self, job_id: &str, abandon: bool) -> Result<bool> {
        let mut state = self.inner.state();
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| UploadError::NotFound(format!("job {}", job_id)))?;

        if entry.status == JobStatus::Uploading {
            entry.cancel_requested = true;
            entry.abandon_requested |= abandon;
            if let Some(token) = &entry.cancel {
                token.cancel();
            }
            return Ok(true);
        }

        state.remove(job_id);
        drop(state);
        if !abandon {
            self.inner.emit(UploadEvent::Cancelled {
                job_id: job_id.to_string(),
            });
        }
        Ok(false)
    }

    /// Cancels the job, aborts its remote multipart upload and discards its
    /// ledger entry.
    pub async fn abandon(&self, job_id: &str) -> Result<()> {
        let active = self.request_cancel(job_id, true)?;
        if !active {
            self.inner.abort_and_discard(job_id).await;
            self.inner.emit(UploadEvent::Cancelled {
                job_id: job_id.to_string(),
            });
        }
        tracing::info!("🗑️ Abandoned upload {}", job_id);
        Ok(())
    }

    /// Supplies the source for a paused (or failed) job. The file must match
    /// the persisted plan's fingerprint.
    pub async fn reattach(&self, job_id: &str, source: SourceFile) -> Result<()> {
        let Some(data) = source.data.clone() else {
            return Err(UploadError::InvalidInput(format!(
                "{} has no data attached",
                source.name
            )));
        };

        {
            let state = self.inner.state();
            let entry = state
                .jobs
                .get(job_id)
                .ok_or_else(|| UploadError::NotFound(format!("job {}", job_id)))?;
            if !matches!(entry.status, JobStatus::Paused | JobStatus::Failed) {
                return Err(UploadError::InvalidInput(format!(
                    "job {} is {:?}, not waiting for a source",
                    job_id, entry.status
                )));
            }
        }

        let fingerprint = fingerprint(data.clone()).await?;
        match self.inner.ledger.load_plan(job_id).await {
            Ok(plan) => {
                if !plan.encrypted && plan.file_size != data.len() as u64 {
                    return Err(UploadError::SourceMismatch(format!(
                        "{} is {} bytes, the interrupted upload was {}",
                        source.name,
                        data.len(),
                        plan.file_size
                    )));
                }
                let differs = plan
                    .content_fingerprint
                    .as_deref()
                    .is_some_and(|expected| !hash::same_fingerprint(&fingerprint, expected));
                if differs {
                    return Err(UploadError::SourceMismatch(format!(
                        "{} differs from the file originally selected",
                        source.name
                    )));
                }
            }
            Err(UploadError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        {
            let mut state = self.inner.state();
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| UploadError::NotFound(format!("job {}", job_id)))?;
            entry.job.source = source;
            // Prepared bytes of the same file carry the only copy of its key.
            if entry
                .prepared
                .as_ref()
                .is_some_and(|p| p.fingerprint != fingerprint)
            {
                entry.prepared = None;
            }
            entry.status = JobStatus::Queued;
            entry.error = None;
            entry.category = None;
        }

        tracing::info!("📎 Source reattached to {}", job_id);
        self.inner.emit(UploadEvent::StatusChanged {
            job_id: job_id.to_string(),
            status: JobStatus::Queued,
        });
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Re-queues a failed job; it resumes from its ledger.
    pub fn retry(&self, job_id: &str) -> Result<()> {
        {
            let mut state = self.inner.state();
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| UploadError::NotFound(format!("job {}", job_id)))?;
            if entry.status != JobStatus::Failed {
                return Err(UploadError::InvalidInput(format!(
                    "job {} is {:?}, not failed",
                    job_id, entry.status
                )));
            }
            entry.status = JobStatus::Queued;
            entry.error = None;
            entry.category = None;
        }
        self.inner.emit(UploadEvent::StatusChanged {
            job_id: job_id.to_string(),
            status: JobStatus::Queued,
        });
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Re-queues a job whose object is already stored so only registration
    /// runs again.
    pub async fn retry_finalize(&self, job_id: &str) -> Result<()> {
        let plan = self.inner.ledger.load_plan(job_id).await?;
        if plan.completion.is_none() {
            return Err(UploadError::InvalidInput(format!(
                "upload {} has not been completed in storage",
                job_id
            )));
        }
        self.retry(job_id)
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.inner.state().jobs.get(job_id).map(|e| e.status)
    }

    pub fn job(&self, job_id: &str) -> Option<JobSnapshot> {
        self.inner.state().jobs.get(job_id).map(JobEntry::snapshot)
    }

    /// All jobs in submission order.
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        let state = self.inner.state();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(JobEntry::snapshot)
            .collect()
    }

    pub fn ledger(&self) -> &Arc<ChunkLedger> {
        &self.inner.ledger
    }
}
