use crate::{BackendError, ObjectBody, ObjectMeta, ObjectReader, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Size of the chunks a streamed GET is split into.
const CHUNK_SIZE: usize = 16 * 1024;

/// Backend operations, used for call accounting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Head,
    Put,
    Upload,
    Delete,
    List,
    DeleteBatch,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    acl: Option<String>,
    last_modified: i64,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    op: Operation,
    key_contains: String,
    error: BackendError,
}

/// In-memory object store.
///
/// Behaves like a bucket with strong consistency. Every call is counted per
/// [`Operation`], and failures can be injected for keys matching a substring,
/// which is how error paths are exercised without a live service.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    calls: Mutex<HashMap<Operation, usize>>,
    failures: Mutex<Vec<InjectedFailure>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing accounting.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        lock(&self.objects).insert(
            key.to_owned(),
            StoredObject {
                data: data.into(),
                acl: None,
                last_modified: chrono::Utc::now().timestamp_millis(),
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).get(key).map(|o| o.data.clone())
    }

    pub fn acl(&self, key: &str) -> Option<String> {
        lock(&self.objects).get(key).and_then(|o| o.acl.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.objects).contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// Number of calls made for `op` so far.
    pub fn calls(&self, op: Operation) -> usize {
        lock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    /// Make every `op` on a key containing `key_contains` fail with `error`
    /// until [`clear_failures`](Self::clear_failures) is called.
    pub fn fail(&self, op: Operation, key_contains: &str, error: BackendError) {
        lock(&self.failures).push(InjectedFailure {
            op,
            key_contains: key_contains.to_owned(),
            error,
        });
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    fn record(&self, op: Operation, key: &str) -> Result<(), BackendError> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;
        trace!("memory store {op:?} {key}");
        let failures = lock(&self.failures);
        match failures
            .iter()
            .find(|f| f.op == op && key.contains(&f.key_contains))
        {
            Some(f) => Err(f.error.clone()),
            None => Ok(()),
        }
    }

    fn store(&self, key: &str, data: Bytes, acl: Option<&str>) {
        lock(&self.objects).insert(
            key.to_owned(),
            StoredObject {
                data,
                acl: acl.map(str::to_owned),
                last_modified: chrono::Utc::now().timestamp_millis(),
            },
        );
    }
}

struct MemoryBody {
    remaining: Bytes,
}

#[async_trait]
impl ObjectBody for MemoryBody {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, BackendError>> {
        if self.remaining.is_empty() {
            return None;
        }
        let at = self.remaining.len().min(CHUNK_SIZE);
        Some(Ok(self.remaining.split_to(at)))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_object(&self, key: &str) -> Result<ObjectReader, BackendError> {
        self.record(Operation::Get, key)?;
        let data = self
            .object(key)
            .ok_or_else(|| BackendError::no_such_key(key))?;
        Ok(ObjectReader::new(
            Some(data.len() as u64),
            MemoryBody { remaining: data },
        ))
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, BackendError> {
        self.record(Operation::Head, key)?;
        let objects = lock(&self.objects);
        let object = objects
            .get(key)
            // HEAD responses carry no body, so no native code either.
            .ok_or_else(|| BackendError::new(None, Some(404), "Not Found"))?;
        Ok(ObjectMeta {
            key: key.to_owned(),
            content_length: Some(object.data.len() as u64),
            last_modified: Some(object.last_modified),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        acl: Option<&str>,
    ) -> Result<(), BackendError> {
        self.record(Operation::Put, key)?;
        self.store(key, body, acl);
        Ok(())
    }

    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        acl: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<u64, BackendError> {
        self.record(Operation::Upload, key)?;
        if cancel.is_cancelled() {
            return Err(BackendError::aborted());
        }
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| BackendError::io(&e))?;
        if cancel.is_cancelled() {
            return Err(BackendError::aborted());
        }
        let len = data.len() as u64;
        self.store(key, Bytes::from(data), acl);
        Ok(len)
    }

    async fn delete_object(&self, key: &str) -> Result<(), BackendError> {
        self.record(Operation::Delete, key)?;
        lock(&self.objects).remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        self.record(Operation::List, prefix)?;
        Ok(lock(&self.objects)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<(), BackendError> {
        for key in keys {
            self.record(Operation::DeleteBatch, key)?;
        }
        let mut objects = lock(&self.objects);
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }
}
