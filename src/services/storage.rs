use crate::error::{RemoteError, RemoteErrorKind};
use crate::models::{CompletedPart, RemoteCompletion};
use crate::services::ledger::MultipartInit;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

type RemoteResult<T> = Result<T, RemoteError>;

/// Client side of an S3-compatible multipart upload protocol.
#[async_trait]
pub trait MultipartClient: Send + Sync {
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> RemoteResult<MultipartInit>;

    /// Returns the part's completion tag (ETag).
    async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        body: Bytes,
    ) -> RemoteResult<String>;

    /// `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<RemoteCompletion>;

    async fn list_parts(&self, key: &str, upload_id: &str) -> RemoteResult<Vec<CompletedPart>>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> RemoteResult<()>;
}

/// Downloads a stored object, used on the playback side.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch_object(&self, key: &str) -> RemoteResult<Bytes>;
}

/// Maps SDK failures onto [`RemoteErrorKind`] so the retry loop can tell a
/// dropped connection from a rejected part.
fn map_sdk_error<E, R>(err: SdkError<E, R>) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let kind = match &err {
        SdkError::TimeoutError(_) => RemoteErrorKind::Timeout,
        SdkError::DispatchFailure(failure) if failure.is_timeout() => RemoteErrorKind::Timeout,
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => RemoteErrorKind::Network,
        SdkError::ConstructionFailure(_) => RemoteErrorKind::Rejected,
        _ => match err.code() {
            Some("InvalidPart" | "InvalidPartOrder" | "EntityTooSmall") => {
                RemoteErrorKind::InvalidPart
            }
            Some("NoSuchUpload" | "NoSuchKey" | "NoSuchBucket") => RemoteErrorKind::NotFound,
            Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
                RemoteErrorKind::Permission
            }
            Some("QuotaExceeded" | "EntityTooLarge" | "XMinioStorageFull") => {
                RemoteErrorKind::Quota
            }
            Some("SlowDown" | "ServiceUnavailable" | "Throttling") => RemoteErrorKind::Throttled,
            Some("RequestTimeout") => RemoteErrorKind::Timeout,
            Some("InternalError") => RemoteErrorKind::Server,
            _ => RemoteErrorKind::Rejected,
        },
    };
    RemoteError::new(kind, DisplayErrorContext(&err).to_string())
}

pub struct S3MultipartClient {
    client: Client,
    bucket: String,
}

impl S3MultipartClient {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl MultipartClient for S3MultipartClient {
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> RemoteResult<MultipartInit> {
        let metadata: HashMap<String, String> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let res = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(map_sdk_error)?;

        let upload_id = res
            .upload_id()
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::Rejected, "No upload ID"))?;

        Ok(MultipartInit {
            upload_id: upload_id.to_string(),
            key: res.key().unwrap_or(key).to_string(),
        })
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        body: Bytes,
    ) -> RemoteResult<String> {
        let res = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(map_sdk_error)?;

        res.e_tag().map(str::to_string).ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::Server,
                format!("part {} acknowledged without an ETag", part_number),
            )
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<RemoteCompletion> {
        let completed_parts = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .e_tag(&p.etag)
                    .part_number(p.part_number as i32)
                    .build()
            })
            .collect();

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let res = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(RemoteCompletion {
            location: res
                .location()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}/{}", self.bucket, key)),
            etag: res.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> RemoteResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let res = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await
                .map_err(map_sdk_error)?;

            for part in res.parts() {
                if let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) {
                    parts.push(CompletedPart {
                        part_number: number as u32,
                        etag: etag.to_string(),
                    });
                }
            }

            if res.is_truncated().unwrap_or(false) {
                marker = res.next_part_number_marker().map(str::to_string);
                if marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> RemoteResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }
}

#[async_trait]
impl ObjectFetcher for S3MultipartClient {
    async fn fetch_object(&self, key: &str) -> RemoteResult<Bytes> {
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let data = res
            .body
            .collect()
            .await
            .map_err(|e| RemoteError::network(e.to_string()))?;
        Ok(data.into_bytes())
    }
}
