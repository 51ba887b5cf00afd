use crate::translate::convert_backend_error;
use crate::StoreError;
use bytes::Bytes;
use pkgbucket_remote::ObjectStore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, error, trace, warn};

/// Object name of the catalog document under the key prefix.
pub const CATALOG_FILE: &str = "catalog.json";

/// The catalog document: every known package name plus the server secret.
/// Names keep insertion order and are unique.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogDocument {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub secret: String,
}

impl CatalogDocument {
    pub fn from_bytes(data: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Append `name` unless present. Returns whether it was added.
    pub fn add(&mut self, name: &str) -> bool {
        if self.names.iter().any(|n| n == name) {
            return false;
        }
        self.names.push(name.to_owned());
        true
    }

    /// Remove the first occurrence of `name`. Returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.names.iter().position(|n| n == name) {
            Some(idx) => {
                self.names.remove(idx);
                true
            }
            None => false,
        }
    }
}

fn lock(doc: &Mutex<CatalogDocument>) -> MutexGuard<'_, CatalogDocument> {
    doc.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lazily loaded, write-through cache of the catalog object.
///
/// The backing object is read at most once per instance (on first access) and
/// never re-read; every mutation overwrites the whole object. Concurrent
/// writers to the same bucket are last-writer-wins. An in-memory change is
/// kept even when the following write fails.
pub struct Catalog {
    store: Arc<dyn ObjectStore>,
    key: String,
    cache: OnceCell<Mutex<CatalogDocument>>,
}

impl Catalog {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            cache: OnceCell::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_loaded(&self) -> bool {
        self.cache.initialized()
    }

    async fn data(&self) -> Result<&Mutex<CatalogDocument>, StoreError> {
        if self.cache.initialized() {
            trace!("catalog already loaded");
        }
        self.cache.get_or_try_init(|| self.load()).await
    }

    async fn load(&self) -> Result<Mutex<CatalogDocument>, StoreError> {
        debug!("loading catalog from {}", self.key);
        let reader = match self.store.get_object(&self.key).await {
            Ok(reader) => reader,
            Err(e) => {
                if convert_backend_error(e.clone()).is_not_found() {
                    warn!("catalog {} not found, starting with an empty one", self.key);
                    return Ok(Mutex::new(CatalogDocument::default()));
                }
                error!("failed to load catalog {}: {e}", self.key);
                return Err(StoreError::Backend(e));
            }
        };
        let body = reader.collect().await?;
        let doc = CatalogDocument::from_bytes(&body)?;
        debug!("catalog loaded with {} packages", doc.names.len());
        Ok(Mutex::new(doc))
    }

    pub async fn names(&self) -> Result<Vec<String>, StoreError> {
        let data = self.data().await?;
        Ok(lock(data).names.clone())
    }

    pub async fn add(&self, name: &str) -> Result<(), StoreError> {
        debug!("catalog add {name}");
        let data = self.data().await?;
        if !lock(data).add(name) {
            trace!("{name} is already in the catalog");
            return Ok(());
        }
        trace!("{name} has been added");
        self.persist().await
    }

    /// Remove `name` and write the catalog back, whether or not it was listed.
    pub async fn remove(&self, name: &str) -> Result<(), StoreError> {
        debug!("catalog remove {name}");
        let data = self.data().await.map_err(|e| {
            error!("cannot load catalog to remove {name}: {e}");
            StoreError::internal("something went wrong on remove a package")
        })?;
        if lock(data).remove(name) {
            debug!("{name} removed from the catalog");
        }
        self.persist().await
    }

    pub async fn secret(&self) -> Result<String, StoreError> {
        let data = self.data().await?;
        Ok(lock(data).secret.clone())
    }

    pub async fn set_secret(&self, secret: &str) -> Result<(), StoreError> {
        let data = self.data().await?;
        lock(data).secret = secret.to_owned();
        self.persist().await
    }

    /// Overwrite the catalog object with the cached document.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let data = self.data().await?;
        // Serialise a snapshot so the lock is released before the write.
        let body = lock(data).to_bytes()?;
        debug!("writing catalog {} ({} bytes)", self.key, body.len());
        self.store
            .put_object(&self.key, Bytes::from(body), None)
            .await
            .map_err(|e| {
                error!("failed to write catalog {}: {e}", self.key);
                StoreError::Backend(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgbucket_remote::{BackendError, MemoryStore, Operation};

    const KEY: &str = "registry/catalog.json";

    fn catalog() -> (Arc<MemoryStore>, Catalog) {
        let store = Arc::new(MemoryStore::new());
        let catalog = Catalog::new(store.clone(), KEY);
        (store, catalog)
    }

    fn stored(store: &MemoryStore) -> CatalogDocument {
        CatalogDocument::from_bytes(&store.object(KEY).unwrap()).unwrap()
    }

    #[test]
    fn document_add_is_idempotent() {
        let mut doc = CatalogDocument::default();
        assert!(doc.add("a"));
        assert!(!doc.add("a"));
        assert_eq!(doc.names, vec!["a"]);
    }

    #[test]
    fn document_remove_first_occurrence() {
        let mut doc = CatalogDocument {
            names: vec!["a".into(), "b".into(), "a".into()],
            secret: String::new(),
        };
        assert!(doc.remove("a"));
        assert_eq!(doc.names, vec!["b", "a"]);
        assert!(!doc.remove("zzz"));
    }

    #[test]
    fn document_wire_format() {
        let doc = CatalogDocument {
            names: vec!["left-pad".into()],
            secret: "s".into(),
        };
        assert_eq!(
            String::from_utf8(doc.to_bytes().unwrap()).unwrap(),
            r#"{"names":["left-pad"],"secret":"s"}"#
        );
    }

    #[tokio::test]
    async fn missing_object_bootstraps_empty_catalog() {
        let (_store, catalog) = catalog();
        assert!(catalog.names().await.unwrap().is_empty());
        assert_eq!(catalog.secret().await.unwrap(), "");
    }

    #[tokio::test]
    async fn other_load_failures_propagate() {
        let (store, catalog) = catalog();
        store.fail(
            Operation::Get,
            KEY,
            BackendError::new(Some("AccessDenied"), Some(403), "denied"),
        );
        let err = catalog.names().await.unwrap_err();
        assert_eq!(err.status(), 403);
        assert!(!catalog.is_loaded());
    }

    #[tokio::test]
    async fn corrupt_catalog_is_parse_error() {
        let (store, catalog) = catalog();
        store.insert(KEY, "not json");
        assert!(matches!(
            catalog.names().await.unwrap_err(),
            StoreError::Parse(_)
        ));
    }

    #[tokio::test]
    async fn loads_once_per_instance() {
        let (store, catalog) = catalog();
        store.insert(KEY, r#"{"names":["a"],"secret":"x"}"#);
        assert_eq!(catalog.names().await.unwrap(), vec!["a"]);
        assert_eq!(catalog.names().await.unwrap(), vec!["a"]);
        assert_eq!(catalog.secret().await.unwrap(), "x");
        assert_eq!(store.calls(Operation::Get), 1);
    }

    #[tokio::test]
    async fn external_changes_are_not_seen_after_load() {
        let (store, catalog) = catalog();
        store.insert(KEY, r#"{"names":["a"],"secret":""}"#);
        catalog.names().await.unwrap();
        store.insert(KEY, r#"{"names":["a","b"],"secret":""}"#);
        assert_eq!(catalog.names().await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn add_keeps_insertion_order_and_uniqueness() {
        let (store, catalog) = catalog();
        catalog.add("b").await.unwrap();
        catalog.add("a").await.unwrap();
        catalog.add("b").await.unwrap();
        assert_eq!(catalog.names().await.unwrap(), vec!["b", "a"]);
        assert_eq!(stored(&store).names, vec!["b", "a"]);
        // The duplicate add does not write.
        assert_eq!(store.calls(Operation::Put), 2);
    }

    #[tokio::test]
    async fn remove_non_member_still_persists() {
        let (store, catalog) = catalog();
        catalog.add("a").await.unwrap();
        catalog.remove("zzz").await.unwrap();
        assert_eq!(catalog.names().await.unwrap(), vec!["a"]);
        assert_eq!(store.calls(Operation::Put), 2);
    }

    #[tokio::test]
    async fn remove_load_failure_is_internal_error() {
        let (store, catalog) = catalog();
        store.fail(
            Operation::Get,
            KEY,
            BackendError::new(Some("SlowDown"), Some(503), "slow down"),
        );
        let err = catalog.remove("a").await.unwrap_err();
        assert_eq!(err.status(), 500);
        assert!(err.to_string().contains("remove a package"));
    }

    #[tokio::test]
    async fn secret_roundtrip_persists() {
        let (store, catalog) = catalog();
        catalog.set_secret("s3cr3t").await.unwrap();
        assert_eq!(catalog.secret().await.unwrap(), "s3cr3t");
        assert_eq!(stored(&store).secret, "s3cr3t");
    }

    #[tokio::test]
    async fn failed_flush_keeps_in_memory_change() {
        let (store, catalog) = catalog();
        store.fail(
            Operation::Put,
            KEY,
            BackendError::new(Some("InternalError"), Some(500), "boom"),
        );
        let err = catalog.add("a").await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        // Memory and storage now disagree; the cache is not rolled back.
        assert_eq!(catalog.names().await.unwrap(), vec!["a"]);
        assert!(store.object(KEY).is_none());
    }
}
