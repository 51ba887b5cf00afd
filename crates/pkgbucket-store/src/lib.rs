//! Package registry storage on top of a bucket/key object store.
//!
//! This crate provides the pieces a registry host needs to keep its catalog and
//! artifacts in a remote bucket instead of a local directory: the [`Database`]
//! that owns the cached [`Catalog`] of package names and the server secret,
//! [`PackageStorage`] for per-package metadata documents and tarball
//! upload/download pipelines, the companion-file extractor, key layout and
//! access rules, and translation of native backend failures into [`StoreError`].

pub mod access;
pub mod catalog;
pub mod companion;
pub mod config;
pub mod database;
pub mod download;
pub mod fallback;
pub mod layout;
pub mod package;
pub mod translate;
pub mod upload;

pub use access::{AccessRule, AccessRules, NoAccessRules, PackageAccess};
pub use catalog::{Catalog, CatalogDocument, CATALOG_FILE};
pub use companion::{extract_companions, CompanionFile, Companions};
pub use config::{resolve_value, StoreConfig};
pub use database::{Database, PackageInfo, Token};
pub use download::{DownloadEvent, TarballReader};
pub use fallback::FallbackRegistry;
pub use layout::{add_trailing_slash, KeyLayout};
pub use package::{safe_package_name, PackageDocument, PackageStorage, PACKAGE_FILE};
pub use translate::convert_backend_error;
pub use upload::{CompanionWarning, TarballWriter, UploadEvent, UploadReport};

use pkgbucket_remote::BackendError;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("invalid JSON document: {0}")]
    Parse(#[source] Arc<serde_json::Error>),
    #[error("{message} (status {status})")]
    Generic { status: u16, message: String },
    /// A backend failure passed through without classification.
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("staging I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt package archive: {0}")]
    Archive(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn not_found() -> Self {
        StoreError::NotFound("no such package available".to_owned())
    }

    pub fn conflict() -> Self {
        StoreError::Conflict("file already exists".to_owned())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        StoreError::Generic {
            status: 500,
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::internal("request aborted")
    }

    /// HTTP-style status the host should answer with.
    pub fn status(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 404,
            StoreError::Conflict(_) => 409,
            StoreError::ServiceUnavailable(_) => 503,
            StoreError::Generic { status, .. } => *status,
            StoreError::Backend(e) => e.status.unwrap_or(500),
            StoreError::Parse(_)
            | StoreError::Io(_)
            | StoreError::Archive(_)
            | StoreError::Config(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Parse(Arc::new(e))
    }
}

impl Clone for StoreError {
    fn clone(&self) -> Self {
        match self {
            StoreError::NotFound(m) => StoreError::NotFound(m.clone()),
            StoreError::Conflict(m) => StoreError::Conflict(m.clone()),
            StoreError::ServiceUnavailable(m) => StoreError::ServiceUnavailable(m.clone()),
            StoreError::Parse(e) => StoreError::Parse(Arc::clone(e)),
            StoreError::Generic { status, message } => StoreError::Generic {
                status: *status,
                message: message.clone(),
            },
            StoreError::Backend(e) => StoreError::Backend(e.clone()),
            StoreError::Io(e) => StoreError::Io(std::io::Error::new(e.kind(), e.to_string())),
            StoreError::Archive(m) => StoreError::Archive(m.clone()),
            StoreError::Config(m) => StoreError::Config(m.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_of_domain_kinds() {
        assert_eq!(StoreError::not_found().status(), 404);
        assert_eq!(StoreError::conflict().status(), 409);
        assert_eq!(
            StoreError::ServiceUnavailable("x".to_owned()).status(),
            503
        );
        assert_eq!(StoreError::aborted().status(), 500);
        assert_eq!(
            StoreError::Generic {
                status: 403,
                message: "denied".to_owned()
            }
            .status(),
            403
        );
    }

    #[test]
    fn backend_status_passes_through() {
        let e = StoreError::Backend(BackendError::new(Some("SlowDown"), Some(503), "slow"));
        assert_eq!(e.status(), 503);
        let e = StoreError::Backend(BackendError::new(None, None, "dns failure"));
        assert_eq!(e.status(), 500);
    }

    #[test]
    fn display_generic() {
        let e = StoreError::internal("request aborted");
        assert_eq!(e.to_string(), "request aborted (status 500)");
    }

    #[test]
    fn display_conflict() {
        assert!(StoreError::conflict()
            .to_string()
            .contains("file already exists"));
    }

    #[test]
    fn clone_keeps_kind_and_status() {
        let e = StoreError::conflict();
        assert!(e.clone().is_conflict());
        let e = StoreError::from(serde_json::from_str::<serde_json::Value>("{").unwrap_err());
        let cloned = e.clone();
        assert!(matches!(cloned, StoreError::Parse(_)));
        assert_eq!(cloned.to_string(), e.to_string());
        assert_eq!(cloned.status(), 500);
        let e = StoreError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(e.clone().status(), 500);
        assert!(e.clone().to_string().contains("gone"));
    }
}
