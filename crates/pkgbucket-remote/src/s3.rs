use crate::{BackendError, ObjectBody, ObjectMeta, ObjectReader, ObjectStore, S3Config};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, ObjectCannedAcl, ObjectIdentifier,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Files larger than this are sent with a multipart upload.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Maximum number of keys a single DeleteObjects request accepts.
const DELETE_BATCH_LIMIT: usize = 1000;

/// S3-compatible object store backend.
///
/// The client is built once from an [`S3Config`] and shared read-only across
/// all concurrent operations; the SDK pools connections internally.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    part_size: usize,
}

impl S3Backend {
    pub async fn connect(config: &S3Config) -> Result<Self, BackendError> {
        if config.bucket.is_empty() {
            return Err(BackendError::new(
                Some("InvalidConfiguration"),
                None,
                "s3 storage requires a bucket",
            ));
        }
        debug!(
            "connecting to bucket {} (endpoint: {}, region: {}, static credentials: {})",
            config.bucket,
            config.endpoint.as_deref().unwrap_or("default"),
            config.region.as_deref().unwrap_or("default"),
            config.has_static_credentials()
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                id.clone(),
                secret.clone(),
                config.session_token.clone(),
                None,
                "pkgbucket",
            ));
        }
        let shared = loader.load().await;

        let mut builder =
            aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }
        Ok(Self::from_client(
            Client::from_conf(builder.build()),
            &config.bucket,
        ))
    }

    pub fn from_client(client: Client, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_owned(),
            part_size: DEFAULT_PART_SIZE,
        }
    }

    #[must_use]
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        // S3 rejects parts below 5 MiB except the last one.
        self.part_size = part_size.max(5 * 1024 * 1024);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        acl: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| BackendError::new(None, None, format!("cannot read {}: {e}", path.display())))?;
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_acl(acl.map(ObjectCannedAcl::from))
            .body(body)
            .send();
        tokio::select! {
            () = cancel.cancelled() => Err(BackendError::aborted()),
            result = request => result.map(|_| ()).map_err(sdk_error),
        }
    }

    async fn multipart_upload(
        &self,
        key: &str,
        path: &Path,
        acl: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_acl(acl.map(ObjectCannedAcl::from))
            .send()
            .await
            .map_err(sdk_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BackendError::new(None, None, "multipart upload id missing"))?
            .to_owned();
        debug!("multipart upload {upload_id} started for {key}");

        let parts = match self.upload_parts(key, &upload_id, path, cancel).await {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        "failed to abort multipart upload {upload_id} for {key}: {}",
                        DisplayErrorContext(&abort_err)
                    );
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompletedPart>, BackendError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| BackendError::io(&e))?;
        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            let mut buf = Vec::with_capacity(self.part_size);
            let read = (&mut file)
                .take(self.part_size as u64)
                .read_to_end(&mut buf)
                .await
                .map_err(|e| BackendError::io(&e))?;
            if read == 0 {
                break;
            }
            trace!("uploading part {part_number} of {key} ({read} bytes)");
            let request = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send();
            let uploaded = tokio::select! {
                () = cancel.cancelled() => return Err(BackendError::aborted()),
                result = request => result.map_err(sdk_error)?,
            };
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_owned))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
        }
        Ok(parts)
    }
}

/// Capture the native code, status and message of an SDK failure.
fn sdk_error<E>(err: SdkError<E, HttpResponse>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|resp| resp.status().as_u16());
    let code = err.code().map(str::to_owned);
    let message = err
        .message()
        .map_or_else(|| DisplayErrorContext(&err).to_string(), str::to_owned);
    BackendError {
        code,
        status,
        message,
    }
}

struct S3Body(ByteStream);

#[async_trait]
impl ObjectBody for S3Body {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, BackendError>> {
        self.0
            .next()
            .await
            .map(|chunk| chunk.map_err(|e| BackendError::new(None, None, e.to_string())))
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    async fn get_object(&self, key: &str) -> Result<ObjectReader, BackendError> {
        debug!("GET s3://{}/{key}", self.bucket);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_error)?;
        let content_length = output.content_length().and_then(|n| u64::try_from(n).ok());
        Ok(ObjectReader::new(content_length, S3Body(output.body)))
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, BackendError> {
        debug!("HEAD s3://{}/{key}", self.bucket);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(ObjectMeta {
            key: key.to_owned(),
            content_length: output.content_length().and_then(|n| u64::try_from(n).ok()),
            last_modified: output.last_modified().and_then(|t| t.to_millis().ok()),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        acl: Option<&str>,
    ) -> Result<(), BackendError> {
        debug!("PUT s3://{}/{key} ({} bytes)", self.bucket, body.len());
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_acl(acl.map(ObjectCannedAcl::from))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        acl: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<u64, BackendError> {
        let len = tokio::fs::metadata(path)
            .await
            .map_err(|e| BackendError::io(&e))?
            .len();
        debug!("upload {} -> s3://{}/{key} ({len} bytes)", path.display(), self.bucket);
        if len > self.part_size as u64 {
            self.multipart_upload(key, path, acl, cancel).await?;
        } else {
            self.put_file(key, path, acl, cancel).await?;
        }
        Ok(len)
    }

    async fn delete_object(&self, key: &str) -> Result<(), BackendError> {
        debug!("DELETE s3://{}/{key}", self.bucket);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        debug!("LIST s3://{}/{prefix}", self.bucket);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(sdk_error)?;
            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_owned)),
            );
            match output.next_continuation_token() {
                Some(next) if output.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_owned());
                }
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<(), BackendError> {
        for batch in keys.chunks(DELETE_BATCH_LIMIT) {
            debug!("DELETE {} keys from s3://{}", batch.len(), self.bucket);
            let ids = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BackendError::new(None, None, e.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(ids))
                .build()
                .map_err(|e| BackendError::new(None, None, e.to_string()))?;
            let output = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(sdk_error)?;
            if let Some(failed) = output.errors().first() {
                return Err(BackendError::new(
                    failed.code(),
                    None,
                    format!(
                        "failed to delete {}: {}",
                        failed.key().unwrap_or("?"),
                        failed.message().unwrap_or("unknown error")
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_requires_bucket() {
        let err = S3Backend::connect(&S3Config::default()).await.unwrap_err();
        assert!(err.message.contains("requires a bucket"));
    }

    #[tokio::test]
    async fn part_size_has_service_minimum() {
        let config = S3Config::new("bucket")
            .with_endpoint("http://127.0.0.1:1")
            .with_region("us-east-1")
            .with_credentials("id", "secret");
        let backend = S3Backend::connect(&config).await.unwrap().with_part_size(1);
        assert_eq!(backend.part_size, 5 * 1024 * 1024);
        assert_eq!(backend.bucket(), "bucket");
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_error_without_status() {
        let config = S3Config::new("bucket")
            .with_endpoint("http://127.0.0.1:1")
            .with_region("us-east-1")
            .with_credentials("id", "secret");
        let backend = S3Backend::connect(&config).await.unwrap();
        let err = backend.head_object("missing").await.unwrap_err();
        assert!(err.status.is_none());
        assert!(!err.message.is_empty());
    }
}
