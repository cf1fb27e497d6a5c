#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use rust_upload_engine::config::UploadConfig;
use rust_upload_engine::error::{RemoteError, RemoteErrorKind};
use rust_upload_engine::models::{CompletedPart, RemoteCompletion};
use rust_upload_engine::services::backoff::BackoffStrategy;
use rust_upload_engine::services::ledger::{ChunkLedger, MultipartInit};
use rust_upload_engine::services::ledger_store::{LedgerStore, MemoryLedgerStore};
use rust_upload_engine::services::registrar::{Finalizer, RegisteredEntity, RegistrationRequest};
use rust_upload_engine::services::scheduler::{UploadEvent, UploadScheduler};
use rust_upload_engine::services::storage::{MultipartClient, ObjectFetcher};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

pub const MIB: u64 = 1024 * 1024;

struct MockUpload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

/// In-memory S3-style multipart service with switches for injecting faults.
#[derive(Default)]
pub struct MockStorage {
    uploads: Mutex<HashMap<String, MockUpload>>,
    objects: Mutex<HashMap<String, Bytes>>,
    next_id: AtomicU32,
    /// Part number -> failures still to inject.
    failures: Mutex<HashMap<u32, u32>>,
    /// `(key substring, part number)` that never answers.
    hang_on: Mutex<Option<(String, u32)>>,
    lose_upload_once: AtomicBool,
    pub part_calls: Mutex<Vec<(String, u32)>>,
    pub creates: AtomicU32,
    pub completions: AtomicU32,
    pub aborted: Mutex<Vec<String>>,
}

impl MockStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_part(&self, part_number: u32, times: u32) {
        self.failures.lock().unwrap().insert(part_number, times);
    }

    pub fn hang_on(&self, key_fragment: &str, part_number: u32) {
        *self.hang_on.lock().unwrap() = Some((key_fragment.to_string(), part_number));
    }

    pub fn clear_hang(&self) {
        *self.hang_on.lock().unwrap() = None;
    }

    pub fn lose_next_upload(&self) {
        self.lose_upload_once.store(true, Ordering::SeqCst);
    }

    pub fn calls_for(&self, upload_id: &str) -> Vec<u32> {
        self.part_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == upload_id)
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn in_flight(&self, upload_id: &str, part_number: u32) -> bool {
        self.calls_for(upload_id).contains(&part_number)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn stored_parts(&self, upload_id: &str) -> usize {
        self.uploads
            .lock()
            .unwrap()
            .get(upload_id)
            .map(|u| u.parts.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MultipartClient for MockStorage {
    async fn create_multipart_upload(
        &self,
        key: &str,
        _content_type: &str,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<MultipartInit, RemoteError> {
        let id = format!("mpu-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.uploads.lock().unwrap().insert(
            id.clone(),
            MockUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(MultipartInit {
            upload_id: id,
            key: key.to_string(),
        })
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, RemoteError> {
        self.part_calls
            .lock()
            .unwrap()
            .push((upload_id.to_string(), part_number));

        if self.lose_upload_once.swap(false, Ordering::SeqCst) {
            self.uploads.lock().unwrap().remove(upload_id);
        }

        let hang = self
            .hang_on
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|(fragment, n)| key.contains(fragment.as_str()) && *n == part_number);
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&part_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RemoteError::network("connection reset by peer"));
                }
            }
        }

        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, "NoSuchUpload"))?;
        let etag = format!("\"{}-{}\"", part_number, body.len());
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<RemoteCompletion, RemoteError> {
        assert!(
            parts.windows(2).all(|w| w[0].part_number < w[1].part_number),
            "parts must be sorted"
        );

        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, "NoSuchUpload"))?;

        let mut object = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, body)) if *etag == part.etag => object.extend_from_slice(body),
                _ => {
                    return Err(RemoteError::new(
                        RemoteErrorKind::InvalidPart,
                        format!("part {} does not match", part.part_number),
                    ));
                }
            }
        }
        if parts.len() != upload.parts.len() {
            return Err(RemoteError::new(
                RemoteErrorKind::InvalidPart,
                "part list incomplete",
            ));
        }

        let stored_key = upload.key.clone();
        uploads.remove(upload_id);
        self.objects
            .lock()
            .unwrap()
            .insert(stored_key.clone(), Bytes::from(object));
        self.completions.fetch_add(1, Ordering::SeqCst);

        Ok(RemoteCompletion {
            location: format!("https://storage.test/uploads/{}", key),
            etag: format!("\"final-{}\"", parts.len()),
        })
    }

    async fn list_parts(&self, _key: &str, upload_id: &str) -> Result<Vec<CompletedPart>, RemoteError> {
        let uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, "NoSuchUpload"))?;
        Ok(upload
            .parts
            .iter()
            .map(|(n, (etag, _))| CompletedPart {
                part_number: *n,
                etag: etag.clone(),
            })
            .collect())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<(), RemoteError> {
        self.uploads.lock().unwrap().remove(upload_id);
        self.aborted.lock().unwrap().push(upload_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl ObjectFetcher for MockStorage {
    async fn fetch_object(&self, key: &str) -> Result<Bytes, RemoteError> {
        self.object(key)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, "NoSuchKey"))
    }
}

/// Records every registration; can be switched to fail.
#[derive(Default)]
pub struct MockFinalizer {
    failing: AtomicBool,
    pub calls: AtomicU32,
    pub registered: Mutex<Vec<RegistrationRequest>>,
}

impl MockFinalizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn last(&self) -> Option<RegistrationRequest> {
        self.registered.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Finalizer for MockFinalizer {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegisteredEntity, RemoteError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::new(RemoteErrorKind::Server, "502 Bad Gateway"));
        }
        self.registered.lock().unwrap().push(request.clone());
        Ok(RegisteredEntity {
            id: format!("content-{}", n),
            url: Some(request.location.clone()),
        })
    }
}

/// Fast, deterministic retries.
pub fn test_config() -> UploadConfig {
    UploadConfig {
        chunk_size: 5 * MIB,
        multipart_threshold: 5 * MIB,
        max_retries: 5,
        backoff_strategy: BackoffStrategy::Exponential,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        jitter: false,
        finalize_max_retries: 2,
        ..UploadConfig::development()
    }
}

pub fn memory_ledger(store: Arc<dyn LedgerStore>) -> Arc<ChunkLedger> {
    Arc::new(ChunkLedger::new(store, "upload_ledger:"))
}

pub struct Harness {
    pub store: Arc<MemoryLedgerStore>,
    pub storage: Arc<MockStorage>,
    pub finalizer: Arc<MockFinalizer>,
    pub scheduler: UploadScheduler,
}

impl Harness {
    pub fn new(config: UploadConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(MemoryLedgerStore::new()),
            MockStorage::new(),
            MockFinalizer::new(),
        )
    }

    /// A fresh scheduler over existing collaborators, as after a reload.
    pub fn with_parts(
        config: UploadConfig,
        store: Arc<MemoryLedgerStore>,
        storage: Arc<MockStorage>,
        finalizer: Arc<MockFinalizer>,
    ) -> Self {
        let scheduler = UploadScheduler::new(
            config,
            memory_ledger(store.clone()),
            storage.clone(),
            finalizer.clone(),
        );
        Self {
            store,
            storage,
            finalizer,
            scheduler,
        }
    }
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Reads events until `matches` accepts one, or panics after 10 seconds.
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<UploadEvent>, mut matches: F) -> UploadEvent
where
    F: FnMut(&UploadEvent) -> bool,
{
    let deadline = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    });
    deadline.await.expect("timed out waiting for event")
}

/// Polls `condition` every 5 ms for up to 10 seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    result.expect("condition not reached in time");
}
