use crate::companion::{extract_companions, CompanionFile, Companions};
use crate::package::PackageStorage;
use crate::translate::convert_backend_error;
use crate::StoreError;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Chunks buffered between the writer and the staging task.
const STAGE_BUFFER: usize = 16;

/// Lifecycle events of a tarball upload.
#[derive(Debug)]
pub enum UploadEvent {
    /// The destination is free and the writer accepts data.
    Open,
    Success(UploadReport),
    Error(StoreError),
}

/// A companion file that could not be mirrored. Never fails the upload.
#[derive(Debug, Clone)]
pub struct CompanionWarning {
    pub file: CompanionFile,
    pub key: String,
    pub error: StoreError,
}

/// Outcome of a completed upload.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub key: String,
    pub bytes: u64,
    pub companions_uploaded: Vec<CompanionFile>,
    pub warnings: Vec<CompanionWarning>,
}

enum StageMsg {
    Data(Bytes),
    End,
}

/// Write side of a tarball upload.
///
/// The pipeline runs on its own task: probe the destination, stage the
/// incoming bytes to a temporary file, mirror the companion files, upload the
/// archive, clean up. Feed it with [`write`](Self::write), close it with
/// [`end`](Self::end) and watch [`next_event`](Self::next_event) or await
/// [`finish`](Self::finish). Dropping the writer before `end` aborts.
pub struct TarballWriter {
    data: Option<mpsc::Sender<StageMsg>>,
    events: mpsc::UnboundedReceiver<UploadEvent>,
    cancel: CancellationToken,
    ended: bool,
}

impl TarballWriter {
    pub(crate) fn spawn(package: PackageStorage, file: &str) -> Self {
        let (data_tx, data_rx) = mpsc::channel(STAGE_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = UploadTask {
            key: package.key(file),
            package,
            data: data_rx,
            events: event_tx,
            cancel: cancel.clone(),
            probed: false,
        };
        tokio::spawn(task.run());
        Self {
            data: Some(data_tx),
            events: event_rx,
            cancel,
            ended: false,
        }
    }

    /// Queue a chunk for staging.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), StoreError> {
        let Some(tx) = self.data.as_ref() else {
            return Err(StoreError::internal("upload stream already ended"));
        };
        tx.send(StageMsg::Data(chunk.into()))
            .await
            .map_err(|_| StoreError::internal("upload is no longer accepting data"))
    }

    /// Signal the end of the byte stream.
    pub async fn end(&mut self) -> Result<(), StoreError> {
        let Some(tx) = self.data.take() else {
            return Ok(());
        };
        self.ended = true;
        tx.send(StageMsg::End)
            .await
            .map_err(|_| StoreError::internal("upload is no longer accepting data"))
    }

    /// Cancel the upload. Safe to call repeatedly and at any stage.
    pub fn abort(&self) {
        if !self.cancel.is_cancelled() {
            debug!("upload aborted by caller");
        }
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next lifecycle event, `None` once the pipeline is gone.
    pub async fn next_event(&mut self) -> Option<UploadEvent> {
        self.events.recv().await
    }

    /// End the stream if needed and wait for the terminal event.
    pub async fn finish(mut self) -> Result<UploadReport, StoreError> {
        // A failed end means the pipeline already stopped; its event says why.
        let _ = self.end().await;
        while let Some(event) = self.next_event().await {
            match event {
                UploadEvent::Open => {}
                UploadEvent::Success(report) => return Ok(report),
                UploadEvent::Error(e) => return Err(e),
            }
        }
        Err(StoreError::aborted())
    }
}

impl Drop for TarballWriter {
    fn drop(&mut self) {
        if !self.ended {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for TarballWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarballWriter")
            .field("ended", &self.ended)
            .field("aborted", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

struct UploadTask {
    package: PackageStorage,
    key: String,
    data: mpsc::Receiver<StageMsg>,
    events: mpsc::UnboundedSender<UploadEvent>,
    cancel: CancellationToken,
    probed: bool,
}

impl UploadTask {
    async fn run(mut self) {
        debug!("upload {} started", self.key);
        let event = match self.execute().await {
            Ok(report) => {
                info!(
                    "uploaded {} ({} bytes, {} companions)",
                    report.key,
                    report.bytes,
                    report.companions_uploaded.len()
                );
                UploadEvent::Success(report)
            }
            Err(e) => {
                if self.cancel.is_cancelled() && self.probed {
                    self.discard_destination().await;
                }
                if e.is_conflict() {
                    debug!("upload {} rejected: {e}", self.key);
                } else {
                    error!("upload {} failed: {e}", self.key);
                }
                UploadEvent::Error(e)
            }
        };
        self.data.close();
        let _ = self.events.send(event);
    }

    async fn execute(&mut self) -> Result<UploadReport, StoreError> {
        self.probe().await?;
        self.probed = true;
        let _ = self.events.send(UploadEvent::Open);

        let (file, path) = self.create_staging_file().await?;
        let outcome = self.stage_and_upload(file, &path).await;
        cleanup(path).await;
        outcome
    }

    /// The destination must not exist yet.
    async fn probe(&self) -> Result<(), StoreError> {
        trace!("probe {}", self.key);
        let head = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(StoreError::aborted()),
            head = self.package.store.head_object(&self.key) => head,
        };
        match head {
            Ok(_) => Err(StoreError::conflict()),
            Err(e) if convert_backend_error(e.clone()).is_not_found() => Ok(()),
            Err(e) => Err(StoreError::Backend(e)),
        }
    }

    /// The file is removed by [`cleanup`], not on drop.
    async fn create_staging_file(&self) -> Result<(std::fs::File, PathBuf), StoreError> {
        let dir = self.package.staging_dir();
        let prefix = self.package.staging_prefix();
        let temp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".tgz")
                .tempfile_in(dir)
        })
        .await
        .map_err(|e| StoreError::internal(format!("staging task failed: {e}")))??;
        let (file, path) = temp.into_parts();
        let path = path.keep().map_err(|e| StoreError::Io(e.error))?;
        debug!("staging {} at {}", self.key, path.display());
        Ok((file, path))
    }

    async fn stage_and_upload(
        &mut self,
        file: std::fs::File,
        path: &Path,
    ) -> Result<UploadReport, StoreError> {
        let mut out = tokio::fs::File::from_std(file);
        self.stage(&mut out).await?;
        out.flush().await?;
        drop(out);

        let archive = path.to_path_buf();
        let companions = tokio::task::spawn_blocking(move || extract_companions(&archive))
            .await
            .map_err(|e| StoreError::internal(format!("extraction task failed: {e}")))??;
        let (companions_uploaded, warnings) = self.mirror_companions(companions).await?;

        let bytes = self
            .package
            .store
            .upload_file(
                &self.key,
                path,
                Some(self.package.tarball_acl()),
                &self.cancel,
            )
            .await
            .map_err(convert_backend_error)?;

        Ok(UploadReport {
            key: self.key.clone(),
            bytes,
            companions_uploaded,
            warnings,
        })
    }

    /// Copy the incoming chunks into the staging file until `End`.
    async fn stage(&mut self, out: &mut tokio::fs::File) -> Result<u64, StoreError> {
        let mut written = 0u64;
        loop {
            let msg = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(StoreError::aborted()),
                msg = self.data.recv() => msg,
            };
            match msg {
                Some(StageMsg::Data(chunk)) => {
                    out.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                Some(StageMsg::End) => {
                    debug!("staged {written} bytes for {}", self.key);
                    return Ok(written);
                }
                None => {
                    warn!("upload stream for {} closed without end", self.key);
                    return Err(StoreError::aborted());
                }
            }
        }
    }

    /// Upload every companion found. Failures become warnings.
    async fn mirror_companions(
        &self,
        companions: Companions,
    ) -> Result<(Vec<CompanionFile>, Vec<CompanionWarning>), StoreError> {
        let mut uploaded = Vec::new();
        let mut warnings = Vec::new();
        for file in CompanionFile::ALL {
            let Some(content) = companions.get(file) else {
                continue;
            };
            if self.cancel.is_cancelled() {
                return Err(StoreError::aborted());
            }
            let key = self.package.key(file.file_name());
            debug!("mirroring {file} to {key}");
            match self
                .package
                .store
                .put_object(&key, Bytes::from(content.to_owned()), None)
                .await
            {
                Ok(()) => uploaded.push(file),
                Err(e) => {
                    let error = convert_backend_error(e);
                    warn!("could not upload {key}: {error}");
                    warnings.push(CompanionWarning { file, key, error });
                }
            }
        }
        Ok((uploaded, warnings))
    }

    /// Best-effort removal of a partially written destination.
    async fn discard_destination(&self) {
        debug!("removing partial upload {}", self.key);
        if let Err(e) = self.package.store.delete_object(&self.key).await {
            warn!("failed to remove partial upload {}: {e}", self.key);
        }
    }
}

/// Delete the staging file, logging failures.
async fn cleanup(path: PathBuf) {
    let shown = path.display().to_string();
    let removed = tokio::task::spawn_blocking(move || std::fs::remove_file(&path)).await;
    match removed {
        Ok(Ok(())) => debug!("removed staging file {shown}"),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Ok(Err(e)) => warn!("failed to remove staging file {shown}: {e}"),
        Err(e) => warn!("cleanup task for {shown} failed: {e}"),
    }
}
