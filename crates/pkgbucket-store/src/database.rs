use crate::access::PackageAccess;
use crate::catalog::Catalog;
use crate::companion::CompanionFile;
use crate::config::StoreConfig;
use crate::fallback::FallbackRegistry;
use crate::layout::KeyLayout;
use crate::package::{PackageStorage, PACKAGE_FILE};
use crate::translate::convert_backend_error;
use crate::StoreError;
use pkgbucket_remote::{ObjectStore, S3Backend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A catalogued package whose metadata document exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub path: String,
    /// Last modification of the metadata document, epoch milliseconds.
    pub time: i64,
}

/// An API token as hosts model it. Token storage is not supported by this
/// backend; the type exists so the token operations have a signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub user: String,
    pub key: String,
    pub token: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub cidr: Vec<String>,
    pub created: i64,
}

fn not_implemented(op: &str) -> StoreError {
    warn!("[{op}] is not supported by the object store backend");
    StoreError::ServiceUnavailable(format!("[{op}] method not implemented"))
}

/// Entry point of the registry storage: the catalog of package names and the
/// server secret, plus a factory for per-package storage.
///
/// All package storages share the object store handle; the catalog cache is
/// the only mutable state and belongs to this instance.
pub struct Database {
    config: StoreConfig,
    store: Arc<dyn ObjectStore>,
    layout: KeyLayout,
    catalog: Catalog,
    fallback: Option<Arc<FallbackRegistry>>,
}

impl Database {
    /// Build over an existing store, resolving storage folders with the
    /// configured `packages` rules.
    pub fn new(config: StoreConfig, store: Arc<dyn ObjectStore>) -> Result<Self, StoreError> {
        let access = Arc::new(config.packages.clone());
        Self::with_access(config, store, access)
    }

    /// Build with a host-provided access resolver.
    pub fn with_access(
        config: StoreConfig,
        store: Arc<dyn ObjectStore>,
        access: Arc<dyn PackageAccess>,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let layout = KeyLayout::new(&config.key_prefix, access);
        let catalog = Catalog::new(Arc::clone(&store), layout.catalog_key());
        let fallback = FallbackRegistry::new(&config.fallback_registry).map(Arc::new);
        info!(
            "registry storage on bucket {} (prefix {:?}, fallback {})",
            config.s3.bucket,
            layout.prefix(),
            fallback.as_ref().map_or("disabled", |f| f.base_url())
        );
        Ok(Self {
            config,
            store,
            layout,
            catalog,
            fallback,
        })
    }

    /// Connect to S3 as configured.
    pub async fn connect(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let backend = S3Backend::connect(&config.s3).await?;
        Self::new(config, Arc::new(backend))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn names(&self) -> Result<Vec<String>, StoreError> {
        self.catalog.names().await
    }

    pub async fn add(&self, name: &str) -> Result<(), StoreError> {
        self.catalog.add(name).await
    }

    pub async fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.catalog.remove(name).await
    }

    pub async fn secret(&self) -> Result<String, StoreError> {
        self.catalog.secret().await
    }

    pub async fn set_secret(&self, secret: &str) -> Result<(), StoreError> {
        self.catalog.set_secret(secret).await
    }

    /// Storage for one package.
    pub fn package(&self, name: &str) -> PackageStorage {
        debug!("package storage for {name}");
        PackageStorage::new(name, self.layout.clone(), Arc::clone(&self.store))
            .with_tarball_acl(&self.config.tarball_acl)
            .with_staging_dir(self.config.staging_dir.clone())
            .with_fallback(self.fallback.clone())
    }

    pub async fn save_token(&self, _token: Token) -> Result<(), StoreError> {
        Err(not_implemented("saveToken"))
    }

    pub async fn delete_token(&self, _user: &str, _key: &str) -> Result<(), StoreError> {
        Err(not_implemented("deleteToken"))
    }

    pub async fn read_tokens(&self, _user: &str) -> Result<Vec<Token>, StoreError> {
        Err(not_implemented("readTokens"))
    }

    /// Every catalogued package with a metadata document, with its
    /// modification time. Packages that cannot be probed are skipped.
    pub async fn search(&self) -> Result<Vec<PackageInfo>, StoreError> {
        let names = self.catalog.names().await?;
        debug!("search over {} packages", names.len());
        let mut found = Vec::with_capacity(names.len());
        for name in names {
            let key = self.layout.resolve(&name, &[PACKAGE_FILE]);
            match self.store.head_object(&key).await {
                Ok(meta) => found.push(PackageInfo {
                    path: self.layout.package_path(&name),
                    name,
                    time: meta.last_modified.unwrap_or_default(),
                }),
                Err(e) => {
                    let err = convert_backend_error(e);
                    if err.is_not_found() {
                        debug!("{name} is catalogued but has no metadata");
                    } else {
                        warn!("skipping {name} in search: {err}");
                    }
                }
            }
        }
        Ok(found)
    }

    /// Raw text of a mirrored companion file.
    pub async fn companion_text(
        &self,
        package: &str,
        file: CompanionFile,
    ) -> Result<String, StoreError> {
        let key = self.layout.resolve(package, &[file.file_name()]);
        debug!("read {file} of {package} from {key}");
        let reader = self
            .store
            .get_object(&key)
            .await
            .map_err(convert_backend_error)?;
        let body = reader.collect().await.map_err(convert_backend_error)?;
        String::from_utf8(body.to_vec())
            .map_err(|e| StoreError::internal(format!("{key} is not UTF-8: {e}")))
    }

    /// Parsed content of a mirrored companion file.
    pub async fn companion_json(
        &self,
        package: &str,
        file: CompanionFile,
    ) -> Result<serde_json::Value, StoreError> {
        let text = self.companion_text(package, file).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// `extension.json` of every catalogued package that has a readable one.
    pub async fn all_extension_manifests(
        &self,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let names = self.catalog.names().await?;
        let mut manifests = Vec::new();
        for name in names {
            match self.companion_json(&name, CompanionFile::Extension).await {
                Ok(manifest) if manifest.is_object() => manifests.push((name, manifest)),
                Ok(_) => warn!("skipping extension.json of {name}: not a JSON object"),
                Err(e) if e.is_not_found() => debug!("{name} has no extension.json"),
                Err(e) => warn!("skipping extension.json of {name}: {e}"),
            }
        }
        Ok(manifests)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("bucket", &self.config.s3.bucket)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
