//! Resumable, encrypted multipart upload engine.
//!
//! An [`UploadScheduler`] admits one [`UploadJob`] at a time, optionally
//! encrypts its payload, and hands it to a [`TransferController`] which
//! uploads the chunks recorded in a [`ChunkLedger`]. Once storage has the
//! object, a [`Finalizer`] registers it with the application.

pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

pub use config::UploadConfig;
pub use error::{FailureCategory, RemoteError, RemoteErrorKind, Result, UploadError};
pub use models::{
    AssetDetails, ChunkPlan, ChunkRecord, ChunkStatus, JobStatus, SourceFile, UploadJob,
};
pub use services::backoff::{BackoffPolicy, BackoffStrategy, compute_delay};
pub use services::encryption::{EncryptionAlgorithm, EncryptionMaterial, EncryptionPipeline};
pub use services::ledger::ChunkLedger;
pub use services::registrar::{Finalizer, HttpFinalizer, RegisteredEntity, RegistrationRequest};
pub use services::retry::RetryExecutor;
pub use services::scheduler::{JobSnapshot, UploadEvent, UploadScheduler};
pub use services::storage::{MultipartClient, ObjectFetcher, S3MultipartClient};
pub use services::transfer::{TransferController, TransferEvent, TransferReport};
