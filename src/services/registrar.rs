//! Registration of a finished object against the application's metadata.

use crate::error::{RemoteError, RemoteErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Body of the finalize call. Carries the encryption key, so it is the only
/// place key material leaves the process.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub upload_job_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub preview: bool,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub object_key: String,
    pub location: String,
    pub etag: String,
    pub is_encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_algorithm: Option<String>,
    /// SHA-256 of the source file, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl fmt::Debug for RegistrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationRequest")
            .field("upload_job_id", &self.upload_job_id)
            .field("title", &self.title)
            .field("object_key", &self.object_key)
            .field("location", &self.location)
            .field("file_size", &self.file_size)
            .field("is_encrypted", &self.is_encrypted)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("encryption_algorithm", &self.encryption_algorithm)
            .finish_non_exhaustive()
    }
}

/// What the metadata layer created for the upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredEntity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegisteredEntity, RemoteError>;
}

/// POSTs the registration as JSON to a fixed endpoint.
pub struct HttpFinalizer {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpFinalizer {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint, token)
    }

    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            token,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Finalizer for HttpFinalizer {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegisteredEntity, RemoteError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::new(
                RemoteErrorKind::from_status(status.as_u16()),
                format!("registration rejected with {}: {}", status, body),
            ));
        }

        let entity = response.json::<RegisteredEntity>().await?;
        tracing::info!(
            "📝 Registered upload {} as entity {}",
            request.upload_job_id,
            entity.id
        );
        Ok(entity)
    }
}
