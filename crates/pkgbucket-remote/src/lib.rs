//! Object-store backends for pkgbucket.
//!
//! This crate provides the bucket/key seam the registry storage is built on:
//! the [`ObjectStore`] trait, an S3 implementation backed by `aws-sdk-s3`, an
//! in-memory implementation used by tests and local runs, and the native
//! [`BackendError`] every backend reports failures with.

pub mod config;
pub mod memory;
pub mod s3;

pub use config::S3Config;
pub use memory::{MemoryStore, Operation};
pub use s3::S3Backend;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Native error code reported when a request was cancelled by the caller.
pub const REQUEST_ABORTED: &str = "RequestAbortedError";
/// Native error code reported when a key does not exist.
pub const NO_SUCH_KEY: &str = "NoSuchKey";

/// A failure as reported by the storage service, before any classification.
///
/// `code` is the service's own error code (`NoSuchKey`, `AccessDenied`, ...),
/// `status` the HTTP status of the response when one was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("object store error ({code}): {message}", code = .code.as_deref().unwrap_or("unknown"))]
pub struct BackendError {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn new(code: Option<&str>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_owned),
            status,
            message: message.into(),
        }
    }

    pub fn no_such_key(key: &str) -> Self {
        Self::new(
            Some(NO_SUCH_KEY),
            Some(404),
            format!("the specified key does not exist: {key}"),
        )
    }

    pub fn aborted() -> Self {
        Self::new(Some(REQUEST_ABORTED), None, "request aborted")
    }

    pub fn io(err: &std::io::Error) -> Self {
        Self::new(None, None, format!("local I/O error: {err}"))
    }

    pub fn is_aborted(&self) -> bool {
        self.code.as_deref() == Some(REQUEST_ABORTED)
    }
}

/// Metadata returned by a metadata-only (HEAD) request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub content_length: Option<u64>,
    /// Last modification time in epoch milliseconds.
    pub last_modified: Option<i64>,
}

/// A chunked response body.
#[async_trait]
pub trait ObjectBody: Send {
    /// Next chunk of the body, `None` once the body is exhausted.
    async fn next_chunk(&mut self) -> Option<Result<Bytes, BackendError>>;
}

/// A streamed GET response: headers are available before the body is read.
pub struct ObjectReader {
    content_length: Option<u64>,
    body: Box<dyn ObjectBody>,
}

impl ObjectReader {
    pub fn new(content_length: Option<u64>, body: impl ObjectBody + 'static) -> Self {
        Self {
            content_length,
            body: Box::new(body),
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, BackendError>> {
        self.body.next_chunk().await
    }

    /// Drain the whole body into memory.
    pub async fn collect(mut self) -> Result<Bytes, BackendError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next_chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Trait for bucket/key object storage backends.
///
/// Keys are full object keys (prefix included). Backends report failures with
/// the service's native codes; classification happens in the caller.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Start a streamed download of an object.
    async fn get_object(&self, key: &str) -> Result<ObjectReader, BackendError>;

    /// Metadata-only existence probe.
    async fn head_object(&self, key: &str) -> Result<ObjectMeta, BackendError>;

    /// Overwrite an object with an in-memory body.
    async fn put_object(&self, key: &str, body: Bytes, acl: Option<&str>)
        -> Result<(), BackendError>;

    /// Upload a local file. Returns the number of bytes uploaded.
    ///
    /// Cancelling `cancel` stops the transfer and reports [`BackendError::aborted`].
    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        acl: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<u64, BackendError>;

    async fn delete_object(&self, key: &str) -> Result<(), BackendError>;

    /// List every key starting with `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// Delete a batch of keys in as few requests as the backend allows.
    async fn delete_objects(&self, keys: &[String]) -> Result<(), BackendError>;
}
