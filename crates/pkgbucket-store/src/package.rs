use crate::config::DEFAULT_TARBALL_ACL;
use crate::download::TarballReader;
use crate::fallback::FallbackRegistry;
use crate::layout::{add_trailing_slash, KeyLayout};
use crate::translate::convert_backend_error;
use crate::upload::TarballWriter;
use crate::StoreError;
use bytes::Bytes;
use pkgbucket_remote::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Object name of the metadata document inside a package folder.
pub const PACKAGE_FILE: &str = "package.json";

/// The per-package metadata document. Its schema belongs to the host.
pub type PackageDocument = serde_json::Value;

/// Name safe to embed in a local file name: `@` and `/` become `-` and a
/// leading `-` is dropped (`@fleet/core` -> `fleet-core`).
pub fn safe_package_name(name: &str) -> String {
    let replaced = name.replace(['@', '/'], "-");
    replaced.trim_start_matches('-').to_owned()
}

/// Storage for one package: its metadata document, its tarballs and the
/// companion files mirrored next to them.
///
/// Obtained from [`crate::Database::package`]. Every call round-trips to the
/// object store; nothing is cached.
#[derive(Clone)]
pub struct PackageStorage {
    name: String,
    path: String,
    layout: KeyLayout,
    pub(crate) store: Arc<dyn ObjectStore>,
    tarball_acl: String,
    staging_dir: Option<PathBuf>,
    pub(crate) fallback: Option<Arc<FallbackRegistry>>,
}

impl PackageStorage {
    pub fn new(name: &str, layout: KeyLayout, store: Arc<dyn ObjectStore>) -> Self {
        let path = layout.package_path(name);
        Self {
            name: name.to_owned(),
            path,
            layout,
            store,
            tarball_acl: DEFAULT_TARBALL_ACL.to_owned(),
            staging_dir: None,
            fallback: None,
        }
    }

    #[must_use]
    pub fn with_tarball_acl(mut self, acl: &str) -> Self {
        self.tarball_acl = acl.to_owned();
        self
    }

    #[must_use]
    pub fn with_staging_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.staging_dir = dir;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: Option<Arc<FallbackRegistry>>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key prefix of this package, without trailing slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tarball_acl(&self) -> &str {
        &self.tarball_acl
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Full object key of `file` inside this package.
    pub fn key(&self, file: &str) -> String {
        self.layout.resolve(&self.name, &[file])
    }

    pub async fn read_package(&self) -> Result<PackageDocument, StoreError> {
        let key = self.key(PACKAGE_FILE);
        debug!("read package {} from {key}", self.name);
        let reader = self.store.get_object(&key).await.map_err(|e| {
            let err = convert_backend_error(e);
            if err.is_not_found() {
                debug!("package {} has no metadata", self.name);
            } else {
                error!("failed to read {key}: {err}");
            }
            err
        })?;
        let body = reader.collect().await.map_err(convert_backend_error)?;
        let doc = serde_json::from_slice(&body).map_err(|e| {
            error!("{key} is not valid JSON: {e}");
            StoreError::from(e)
        })?;
        trace!("package {} read ({} bytes)", self.name, body.len());
        Ok(doc)
    }

    /// Save `doc` unless a metadata document already exists.
    ///
    /// The existence probe and the write are separate requests; two concurrent
    /// creates may both succeed.
    pub async fn create_package(&self, doc: &PackageDocument) -> Result<(), StoreError> {
        let key = self.key(PACKAGE_FILE);
        debug!("create package {} at {key}", self.name);
        match self.store.head_object(&key).await {
            Ok(_) => {
                debug!("package {} already exists", self.name);
                Err(StoreError::conflict())
            }
            Err(e) => {
                let err = convert_backend_error(e);
                if err.is_not_found() {
                    self.save_package(doc).await
                } else {
                    error!("existence probe for {key} failed: {err}");
                    Err(err)
                }
            }
        }
    }

    /// Overwrite the metadata document.
    pub async fn save_package(&self, doc: &PackageDocument) -> Result<(), StoreError> {
        let key = self.key(PACKAGE_FILE);
        let body = serde_json::to_vec_pretty(doc)?;
        debug!("save package {} to {key} ({} bytes)", self.name, body.len());
        self.store
            .put_object(&key, Bytes::from(body), None)
            .await
            .map_err(|e| {
                let err = convert_backend_error(e);
                error!("failed to save {key}: {err}");
                err
            })
    }

    /// Read, transform and save the metadata document.
    ///
    /// Nothing is written when the read or the transform fails.
    pub async fn update_package<F>(&self, transform: F) -> Result<PackageDocument, StoreError>
    where
        F: FnOnce(PackageDocument) -> Result<PackageDocument, StoreError> + Send,
    {
        debug!("update package {}", self.name);
        let current = self.read_package().await?;
        let updated = transform(current).map_err(|e| {
            debug!("update of {} rejected: {e}", self.name);
            e
        })?;
        self.save_package(&updated).await?;
        Ok(updated)
    }

    /// Delete one object (a tarball, usually) of this package.
    pub async fn delete_file(&self, file: &str) -> Result<(), StoreError> {
        let key = self.key(file);
        debug!("delete {key}");
        self.store.delete_object(&key).await.map_err(|e| {
            let err = convert_backend_error(e);
            error!("failed to delete {key}: {err}");
            err
        })
    }

    /// Delete every object of this package. A package with no objects counts
    /// as removed.
    pub async fn remove_package(&self) -> Result<(), StoreError> {
        match self.delete_key_prefix().await {
            Ok(count) => {
                info!("removed package {} ({count} objects)", self.name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("package {} had nothing to remove", self.name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Batch-delete everything under the package prefix. `NotFound` when
    /// the prefix is empty.
    async fn delete_key_prefix(&self) -> Result<usize, StoreError> {
        let prefix = add_trailing_slash(&self.path);
        debug!("listing {prefix} for removal");
        let keys = self
            .store
            .list_objects(&prefix)
            .await
            .map_err(convert_backend_error)?;
        if keys.is_empty() {
            return Err(StoreError::not_found());
        }
        self.store
            .delete_objects(&keys)
            .await
            .map_err(convert_backend_error)?;
        Ok(keys.len())
    }

    /// Start uploading tarball `file`. Must be called inside a tokio runtime.
    pub fn write_tarball(&self, file: &str) -> TarballWriter {
        TarballWriter::spawn(self.clone(), file)
    }

    /// Start downloading tarball `file`. Must be called inside a tokio runtime.
    pub fn read_tarball(&self, file: &str) -> TarballReader {
        TarballReader::spawn(self.clone(), file)
    }

    pub(crate) fn staging_prefix(&self) -> String {
        format!("{}-", safe_package_name(&self.name))
    }
}

impl std::fmt::Debug for PackageStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageStorage")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
