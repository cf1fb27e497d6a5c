mod common;

use common::{
    Harness, MIB, MockFinalizer, MockStorage, memory_ledger, payload, test_config, wait_for_event,
    wait_until,
};
use rust_upload_engine::error::{FailureCategory, UploadError};
use rust_upload_engine::models::{ChunkStatus, JobStatus, SourceFile, UploadJob};
use rust_upload_engine::services::encryption::{EncryptionAlgorithm, EncryptionMaterial, EncryptionPipeline};
use rust_upload_engine::services::ledger_store::MemoryLedgerStore;
use rust_upload_engine::services::scheduler::{UploadEvent, UploadScheduler};
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn job(name: &str, len: usize) -> UploadJob {
    UploadJob::new(SourceFile::from_bytes(name, "video/mp4", payload(len)))
        .with_section("lessons")
        .with_title(format!("Lesson {}", name))
        .with_metadata("course", "rust-101")
}

fn is_completed(job_id: &str) -> impl FnMut(&UploadEvent) -> bool + '_ {
    move |e| matches!(e, UploadEvent::Completed { job_id: id, .. } if id == job_id)
}

fn is_status(job_id: &str, status: JobStatus) -> impl FnMut(&UploadEvent) -> bool + '_ {
    move |e| matches!(e, UploadEvent::StatusChanged { job_id: id, status: s } if id == job_id && *s == status)
}

#[tokio::test]
async fn test_twelve_mb_job_completes_with_two_retries_on_last_chunk() {
    let harness = Harness::new(test_config());
    harness.storage.fail_part(3, 2);
    let mut events = harness.scheduler.subscribe();
    harness.scheduler.start();

    let job_id = harness
        .scheduler
        .enqueue(job("lecture.mp4", (12 * MIB) as usize))
        .unwrap();

    let mut retries_on_part_3 = 0;
    let mut last_progress = None;
    wait_for_event(&mut events, |e| match e {
        UploadEvent::ChunkRetry { part_number: 3, .. } => {
            retries_on_part_3 += 1;
            false
        }
        UploadEvent::Progress { progress, .. } => {
            last_progress = Some(*progress);
            false
        }
        UploadEvent::Completed { job_id: id, .. } => *id == job_id,
        _ => false,
    })
    .await;

    assert_eq!(retries_on_part_3, 2);
    let progress = last_progress.unwrap();
    assert_eq!(progress.completed_chunks, 3);
    assert_eq!(progress.total_chunks, 3);

    // Completed jobs leave the queue along with their payload.
    assert_eq!(harness.scheduler.status(&job_id), None);
    assert!(harness.scheduler.job(&job_id).is_none());
    let registered = harness.finalizer.last().unwrap();
    assert_eq!(registered.upload_job_id, job_id);
    assert_eq!(registered.title, "Lesson lecture.mp4");
    assert!(!registered.is_encrypted);
    assert!(registered.encryption_key.is_none());
    assert_eq!(registered.checksum.as_ref().map(String::len), Some(64));

    // Confirmed completion discards the persisted plan.
    assert!(matches!(
        harness.scheduler.ledger().load_plan(&job_id).await,
        Err(UploadError::NotFound(_))
    ));
    assert!(harness.store.is_empty());

    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_one_job_uploads_at_a_time() {
    let harness = Harness::new(test_config());
    let mut events = harness.scheduler.subscribe();
    harness.scheduler.start();

    let first = harness.scheduler.enqueue(job("one.mp4", 12 * MIB as usize)).unwrap();
    let second = harness.scheduler.enqueue(job("two.mp4", 100)).unwrap();

    let mut uploading = 0usize;
    let mut max_uploading = 0usize;
    let mut order = Vec::new();
    wait_for_event(&mut events, |e| {
        if let UploadEvent::StatusChanged { job_id, status } = e {
            match status {
                JobStatus::Uploading => {
                    uploading += 1;
                    order.push(job_id.clone());
                }
                JobStatus::Completed | JobStatus::Failed | JobStatus::Paused => {
                    uploading = uploading.saturating_sub(1)
                }
                _ => {}
            }
            max_uploading = max_uploading.max(uploading);
            return *job_id == second && *status == JobStatus::Completed;
        }
        false
    })
    .await;

    assert_eq!(max_uploading, 1);
    assert_eq!(order, vec![first.clone(), second.clone()]);
    assert!(harness.scheduler.snapshot().is_empty());
    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_cancel_mid_chunk_keeps_ledger_and_admits_next() {
    let harness = Harness::new(test_config());
    harness.storage.hang_on("big.mp4", 2);
    let mut events = harness.scheduler.subscribe();
    harness.scheduler.start();

    let big = harness.scheduler.enqueue(job("big.mp4", 12 * MIB as usize)).unwrap();
    let small = harness.scheduler.enqueue(job("small.mp4", 1000)).unwrap();

    let ledger = harness.scheduler.ledger().clone();
    let storage = harness.storage.clone();
    let big_id = big.clone();
    wait_until(|| {
        let ledger = ledger.clone();
        let storage = storage.clone();
        let big_id = big_id.clone();
        async move {
            match ledger.load_plan(&big_id).await {
                Ok(plan) => storage.in_flight(&plan.upload_id, 2),
                Err(_) => false,
            }
        }
    })
    .await;

    let before = ledger.load_plan(&big).await.unwrap();
    assert_eq!(before.chunks[1].status, ChunkStatus::Uploading);

    harness.scheduler.cancel(&big).unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, UploadEvent::Cancelled { job_id } if *job_id == big)
    })
    .await;
    wait_for_event(&mut events, is_completed(&small)).await;

    let after = ledger.load_plan(&big).await.unwrap();
    assert_eq!(after.chunks[0].status, ChunkStatus::Completed);
    assert_eq!(after.chunks[1].status, ChunkStatus::Pending);
    assert_eq!(after.chunks[2].status, ChunkStatus::Pending);
    assert_eq!(after.completed_chunks, 1);

    assert_eq!(harness.scheduler.status(&big), None);
    assert_eq!(harness.scheduler.status(&small), None);
    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_finalize_failure_keeps_ledger_and_retry_skips_upload() {
    let harness = Harness::new(test_config());
    harness.finalizer.set_failing(true);
    let mut events = harness.scheduler.subscribe();
    harness.scheduler.start();

    let job_id = harness.scheduler.enqueue(job("final.mp4", 11 * MIB as usize)).unwrap();
    let failed = wait_for_event(&mut events, |e| {
        matches!(e, UploadEvent::Failed { job_id: id, .. } if *id == job_id)
    })
    .await;
    if let UploadEvent::Failed { category, .. } = failed {
        assert_eq!(category, FailureCategory::Network);
    }

    assert_eq!(harness.scheduler.status(&job_id), Some(JobStatus::Failed));
    // 1 attempt + 2 retries.
    assert_eq!(harness.finalizer.calls.load(Ordering::SeqCst), 3);

    let plan = harness.scheduler.ledger().load_plan(&job_id).await.unwrap();
    assert!(plan.is_complete());
    assert!(plan.completion.is_some());
    assert!(harness.storage.object(&plan.key).is_some());

    let parts_uploaded = harness.storage.part_calls.lock().unwrap().len();
    harness.finalizer.set_failing(false);
    harness.scheduler.retry_finalize(&job_id).await.unwrap();
    wait_for_event(&mut events, is_completed(&job_id)).await;

    assert_eq!(harness.storage.part_calls.lock().unwrap().len(), parts_uploaded);
    assert_eq!(harness.storage.completions.load(Ordering::SeqCst), 1);
    assert!(harness.scheduler.ledger().load_plan(&job_id).await.is_err());
    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_lost_remote_upload_restarts_once() {
    let harness = Harness::new(test_config());
    harness.storage.lose_next_upload();
    let mut events = harness.scheduler.subscribe();
    harness.scheduler.start();

    let job_id = harness.scheduler.enqueue(job("lost.mp4", 6 * MIB as usize)).unwrap();
    let mut warnings = Vec::new();
    wait_for_event(&mut events, |e| match e {
        UploadEvent::Warning { job_id: id, message } if *id == job_id => {
            warnings.push(message.clone());
            false
        }
        UploadEvent::Completed { job_id: id, .. } => *id == job_id,
        _ => false,
    })
    .await;

    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("restarting"));
    assert_eq!(harness.storage.creates.load(Ordering::SeqCst), 2);
    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_encrypted_upload_registers_key_and_decrypts() {
    let harness = Harness::new(test_config());
    let mut events = harness.scheduler.subscribe();
    harness.scheduler.start();

    let mut source = vec![0x00, 0x00, 0x00, 0x18];
    source.extend_from_slice(b"ftypmp42");
    source.extend(payload(7 * MIB as usize));
    let upload = UploadJob::new(SourceFile::from_bytes("secret.mp4", "video/mp4", source.clone()))
        .with_encryption(true);
    let job_id = harness.scheduler.enqueue(upload).unwrap();
    wait_for_event(&mut events, is_completed(&job_id)).await;

    let registered = harness.finalizer.last().unwrap();
    assert!(registered.is_encrypted);
    let material = EncryptionMaterial::from_hex(
        registered.encryption_key.as_deref().unwrap(),
        registered.encryption_iv.as_deref().unwrap(),
        EncryptionAlgorithm::Aes256Gcm,
    )
    .unwrap();

    let stored = harness.storage.object(&registered.object_key).unwrap();
    assert_ne!(stored.as_ref(), source.as_slice());

    let asset = EncryptionPipeline::fetch_and_decrypt(
        harness.storage.as_ref(),
        &registered.object_key,
        &material,
        None,
    )
    .await
    .unwrap();
    assert_eq!(asset.data.as_ref(), source.as_slice());
    assert_eq!(asset.content_type, "video/mp4");
    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_enqueue_rejects_empty_and_detached_sources() {
    let harness = Harness::new(test_config());
    let empty = UploadJob::new(SourceFile::from_bytes("empty.mp4", "video/mp4", Vec::<u8>::new()));
    assert!(matches!(
        harness.scheduler.enqueue(empty),
        Err(UploadError::InvalidInput(_))
    ));

    let detached = UploadJob::new(SourceFile::detached("gone.mp4", 10, "video/mp4"));
    assert!(matches!(
        harness.scheduler.enqueue(detached),
        Err(UploadError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_idle_job_cancel_and_retry_rules() {
    let harness = Harness::new(test_config());
    let job_id = harness.scheduler.enqueue(job("idle.mp4", 10)).unwrap();
    assert_eq!(harness.scheduler.status(&job_id), Some(JobStatus::Queued));

    assert!(matches!(
        harness.scheduler.retry(&job_id),
        Err(UploadError::InvalidInput(_))
    ));
    harness.scheduler.cancel(&job_id).unwrap();
    assert_eq!(harness.scheduler.status(&job_id), None);
    assert!(matches!(
        harness.scheduler.cancel(&job_id),
        Err(UploadError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stop_requeues_active_job() {
    let harness = Harness::new(test_config());
    harness.storage.hang_on("paused.mp4", 1);
    let mut events = harness.scheduler.subscribe();
    harness.scheduler.start();

    let job_id = harness.scheduler.enqueue(job("paused.mp4", 100)).unwrap();
    wait_for_event(&mut events, is_status(&job_id, JobStatus::Uploading)).await;
    let storage = harness.storage.clone();
    wait_until(|| {
        let started = !storage.part_calls.lock().unwrap().is_empty();
        async move { started }
    })
    .await;

    harness.scheduler.stop().await;
    assert_eq!(harness.scheduler.status(&job_id), Some(JobStatus::Queued));
    let plan = harness.scheduler.ledger().load_plan(&job_id).await.unwrap();
    assert_eq!(plan.chunks[0].status, ChunkStatus::Pending);
}

#[tokio::test]
async fn test_custom_pipeline_encrypts_new_uploads() {
    let storage = MockStorage::new();
    let finalizer = MockFinalizer::new();
    let scheduler = UploadScheduler::with_pipeline(
        test_config(),
        memory_ledger(Arc::new(MemoryLedgerStore::new())),
        storage.clone(),
        finalizer.clone(),
        EncryptionPipeline::new(EncryptionAlgorithm::ChaCha20Poly1305).unwrap(),
    );
    let mut events = scheduler.subscribe();
    scheduler.start();

    let source = payload(4096);
    let upload = UploadJob::new(SourceFile::from_bytes("quiz.pdf", "application/pdf", source.clone()))
        .with_encryption(true);
    let job_id = scheduler.enqueue(upload).unwrap();
    wait_for_event(&mut events, is_completed(&job_id)).await;

    let registered = finalizer.last().unwrap();
    assert_eq!(registered.encryption_algorithm.as_deref(), Some("chacha20-poly1305"));
    let material = EncryptionMaterial::from_hex(
        registered.encryption_key.as_deref().unwrap(),
        registered.encryption_iv.as_deref().unwrap(),
        EncryptionAlgorithm::ChaCha20Poly1305,
    )
    .unwrap();
    let stored = storage.object(&registered.object_key).unwrap();
    let asset = EncryptionPipeline::decrypt(&stored, &material, None).unwrap();
    assert_eq!(asset.data.as_ref(), source.as_slice());
    scheduler.stop().await;
}

#[tokio::test]
async fn test_reattach_after_failure_keeps_encryption_key() {
    let harness = Harness::new(test_config());
    harness.storage.fail_part(2, 100);
    let mut events = harness.scheduler.subscribe();
    harness.scheduler.start();

    let data = payload(11 * MIB as usize);
    let upload = UploadJob::new(SourceFile::from_bytes("exam.mp4", "video/mp4", data.clone()))
        .with_encryption(true);
    let job_id = harness.scheduler.enqueue(upload).unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, UploadEvent::Failed { job_id: id, .. } if *id == job_id)
    })
    .await;
    let plan = harness.scheduler.ledger().load_plan(&job_id).await.unwrap();
    assert!(plan.encrypted);
    assert_eq!(plan.chunks[0].status, ChunkStatus::Completed);

    harness.storage.fail_part(2, 0);
    harness
        .scheduler
        .reattach(&job_id, SourceFile::from_bytes("exam.mp4", "video/mp4", data))
        .await
        .unwrap();
    wait_for_event(&mut events, is_completed(&job_id)).await;

    // The same remote upload was resumed; part 1 went up once.
    assert!(harness.storage.aborted.lock().unwrap().is_empty());
    assert_eq!(harness.storage.creates.load(Ordering::SeqCst), 1);
    let calls = harness.storage.calls_for(&plan.upload_id);
    assert_eq!(calls.iter().filter(|n| **n == 1).count(), 1);
    let registered = harness.finalizer.last().unwrap();
    assert!(registered.is_encrypted);
    assert!(registered.encryption_key.is_some());
    harness.scheduler.stop().await;
}
