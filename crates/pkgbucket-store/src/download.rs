use crate::fallback::FallbackRegistry;
use crate::package::PackageStorage;
use crate::translate::convert_backend_error;
use crate::StoreError;
use bytes::{Bytes, BytesMut};
use pkgbucket_remote::ObjectReader;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Events buffered ahead of a slow reader.
const EVENT_BUFFER: usize = 16;
const FALLBACK_CHUNK: usize = 64 * 1024;
/// Most `read_to_end` reserves up front. The announced length comes from a
/// remote server and is only a hint.
const MAX_PREALLOC: u64 = 16 * FALLBACK_CHUNK as u64;

/// Lifecycle events of a tarball download, in order:
/// `ContentLength?`, `Open`, `Data*`, then `End` or `Error`.
#[derive(Debug)]
pub enum DownloadEvent {
    ContentLength(u64),
    Open,
    Data(Bytes),
    End,
    Error(StoreError),
}

/// Read side of a tarball download.
///
/// Missing tarballs are fetched from the fallback registry when one is
/// configured; the events then come from the fallback only. Dropping the
/// reader aborts the transfer.
pub struct TarballReader {
    events: mpsc::Receiver<DownloadEvent>,
    cancel: CancellationToken,
}

impl TarballReader {
    pub(crate) fn spawn(package: PackageStorage, file: &str) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let task = DownloadTask {
            key: package.key(file),
            file: file.to_owned(),
            package,
            events: tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());
        Self { events: rx, cancel }
    }

    pub async fn next_event(&mut self) -> Option<DownloadEvent> {
        self.events.recv().await
    }

    /// Stop the transfer. Safe to call repeatedly.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Collect the whole tarball.
    pub async fn read_to_end(mut self) -> Result<Bytes, StoreError> {
        let mut buf = BytesMut::new();
        while let Some(event) = self.next_event().await {
            match event {
                DownloadEvent::ContentLength(len) => {
                    buf.reserve(len.min(MAX_PREALLOC) as usize);
                }
                DownloadEvent::Open => {}
                DownloadEvent::Data(chunk) => buf.extend_from_slice(&chunk),
                DownloadEvent::End => return Ok(buf.freeze()),
                DownloadEvent::Error(e) => return Err(e),
            }
        }
        Err(StoreError::aborted())
    }
}

impl Drop for TarballReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TarballReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarballReader")
            .field("aborted", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

struct DownloadTask {
    package: PackageStorage,
    file: String,
    key: String,
    events: mpsc::Sender<DownloadEvent>,
    cancel: CancellationToken,
}

impl DownloadTask {
    async fn run(self) {
        debug!("download {} started", self.key);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => debug!("download {} aborted", self.key),
            () = self.transfer() => {}
        }
    }

    async fn transfer(&self) {
        match self.package.store.get_object(&self.key).await {
            Ok(reader) => self.relay(reader).await,
            Err(e) => {
                let err = convert_backend_error(e);
                if err.is_not_found() {
                    if let Some(fallback) = self.package.fallback.clone() {
                        self.from_fallback(fallback, err).await;
                        return;
                    }
                    debug!("{} not found and no fallback configured", self.key);
                } else {
                    error!("download {} failed: {err}", self.key);
                }
                self.emit(DownloadEvent::Error(err)).await;
            }
        }
    }

    /// Returns false once the reader is gone.
    async fn emit(&self, event: DownloadEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn relay(&self, mut reader: ObjectReader) {
        if let Some(len) = reader.content_length() {
            if !self.emit(DownloadEvent::ContentLength(len)).await {
                return;
            }
        }
        if !self.emit(DownloadEvent::Open).await {
            return;
        }
        let mut total = 0u64;
        while let Some(chunk) = reader.next_chunk().await {
            match chunk {
                Ok(bytes) => {
                    total += bytes.len() as u64;
                    if !self.emit(DownloadEvent::Data(bytes)).await {
                        return;
                    }
                }
                Err(e) => {
                    let err = convert_backend_error(e);
                    error!("download {} interrupted: {err}", self.key);
                    self.emit(DownloadEvent::Error(err)).await;
                    return;
                }
            }
        }
        debug!("download {} complete ({total} bytes)", self.key);
        self.emit(DownloadEvent::End).await;
    }

    /// Serve the tarball from the public registry. If that fails too the
    /// reader gets `original`.
    async fn from_fallback(&self, fallback: Arc<FallbackRegistry>, original: StoreError) {
        info!(
            "{} missing, trying {}",
            self.key,
            fallback.tarball_url(self.package.name(), &self.file)
        );
        let package = self.package.name().to_owned();
        let file = self.file.clone();
        let tx = self.events.clone();
        let cancel = self.cancel.clone();
        let joined = tokio::task::spawn_blocking(move || {
            relay_fallback(&fallback, &package, &file, &tx, &cancel)
        })
        .await;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("fallback for {} failed: {e}", self.key);
                self.emit(DownloadEvent::Error(original)).await;
            }
            Err(e) => {
                warn!("fallback task for {} failed: {e}", self.key);
                self.emit(DownloadEvent::Error(original)).await;
            }
        }
    }
}

/// Send unless the reader aborted or went away. Returns false when the
/// relay should stop.
fn forward(
    tx: &mpsc::Sender<DownloadEvent>,
    cancel: &CancellationToken,
    event: DownloadEvent,
) -> bool {
    !cancel.is_cancelled() && tx.blocking_send(event).is_ok()
}

/// Blocking relay of a fallback response. Errors only when the response
/// could not be opened; later failures are sent as events.
fn relay_fallback(
    registry: &FallbackRegistry,
    package: &str,
    file: &str,
    tx: &mpsc::Sender<DownloadEvent>,
    cancel: &CancellationToken,
) -> Result<(), StoreError> {
    let mut body = registry.fetch(package, file)?;
    if cancel.is_cancelled() {
        debug!("fallback transfer of {file} aborted before open");
        return Ok(());
    }
    if let Some(len) = body.content_length() {
        if !forward(tx, cancel, DownloadEvent::ContentLength(len)) {
            return Ok(());
        }
    }
    if !forward(tx, cancel, DownloadEvent::Open) {
        return Ok(());
    }
    let mut buf = vec![0u8; FALLBACK_CHUNK];
    loop {
        let event = match body.read(&mut buf) {
            Ok(0) => {
                forward(tx, cancel, DownloadEvent::End);
                return Ok(());
            }
            Ok(n) => DownloadEvent::Data(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("fallback transfer of {file} failed: {e}");
                forward(
                    tx,
                    cancel,
                    DownloadEvent::Error(StoreError::internal(format!(
                        "fallback transfer failed: {e}"
                    ))),
                );
                return Ok(());
            }
        };
        if !forward(tx, cancel, event) {
            debug!("fallback transfer of {file} stopped");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KeyLayout;
    use pkgbucket_remote::{BackendError, MemoryStore, Operation};

    fn package() -> (Arc<MemoryStore>, PackageStorage) {
        let store = Arc::new(MemoryStore::new());
        let pkg = PackageStorage::new("left-pad", KeyLayout::flat("registry"), store.clone());
        (store, pkg)
    }

    #[tokio::test]
    async fn streams_stored_tarball_with_length() {
        let (store, pkg) = package();
        let data = vec![7u8; 40 * 1024];
        store.insert("registry/left-pad/left-pad-1.0.0.tgz", data.clone());

        let mut reader = pkg.read_tarball("left-pad-1.0.0.tgz");
        assert!(matches!(
            reader.next_event().await,
            Some(DownloadEvent::ContentLength(40960))
        ));
        assert!(matches!(reader.next_event().await, Some(DownloadEvent::Open)));
        let mut body = Vec::new();
        loop {
            match reader.next_event().await {
                Some(DownloadEvent::Data(chunk)) => body.extend_from_slice(&chunk),
                Some(DownloadEvent::End) => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn missing_without_fallback_is_not_found() {
        let (_store, pkg) = package();
        let mut reader = pkg.read_tarball("left-pad-9.9.9.tgz");
        match reader.next_event().await {
            Some(DownloadEvent::Error(e)) => assert!(e.is_not_found()),
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_errors_skip_fallback() {
        let (store, pkg) = package();
        let pkg = pkg.with_fallback(FallbackRegistry::new("http://127.0.0.1:9").map(Arc::new));
        store.fail(
            Operation::Get,
            "left-pad-1.0.0.tgz",
            BackendError::new(Some("AccessDenied"), Some(403), "denied"),
        );
        let err = pkg
            .read_tarball("left-pad-1.0.0.tgz")
            .read_to_end()
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[tokio::test]
    async fn unreachable_fallback_reports_original_not_found() {
        let (_store, pkg) = package();
        let pkg = pkg.with_fallback(FallbackRegistry::new("http://127.0.0.1:9").map(Arc::new));
        let err = pkg
            .read_tarball("left-pad-1.0.0.tgz")
            .read_to_end()
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), StoreError::not_found().to_string());
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let (store, pkg) = package();
        store.insert("registry/left-pad/left-pad-1.0.0.tgz", vec![1u8; 1024 * 1024]);
        let mut reader = pkg.read_tarball("left-pad-1.0.0.tgz");
        assert!(reader.next_event().await.is_some());
        reader.abort();
        reader.abort();
        assert!(reader.is_aborted());
        // Whatever was buffered drains, then the stream closes.
        let mut drained = 0;
        while reader.next_event().await.is_some() {
            drained += 1;
        }
        assert!(drained <= EVENT_BUFFER + 1);
    }

    #[tokio::test]
    async fn huge_length_hint_is_not_preallocated() {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let reader = TarballReader {
            events: rx,
            cancel: CancellationToken::new(),
        };
        tx.send(DownloadEvent::ContentLength(9_000_000_000_000_000_000))
            .await
            .unwrap();
        tx.send(DownloadEvent::Open).await.unwrap();
        tx.send(DownloadEvent::Data(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        tx.send(DownloadEvent::End).await.unwrap();
        let body = reader.read_to_end().await.unwrap();
        assert_eq!(&body[..], b"abc");
    }

    #[test]
    fn forward_stops_after_abort() {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        assert!(forward(&tx, &cancel, DownloadEvent::Open));
        cancel.cancel();
        assert!(!forward(&tx, &cancel, DownloadEvent::End));
        drop(tx);
        assert!(matches!(rx.blocking_recv(), Some(DownloadEvent::Open)));
        assert!(rx.blocking_recv().is_none());
    }
}
