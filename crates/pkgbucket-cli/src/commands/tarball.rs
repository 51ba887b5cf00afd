use super::{json_pretty, store_err, EXIT_SUCCESS};
use bytes::Bytes;
use pkgbucket_store::{Database, DownloadEvent, PackageDocument};
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 64 * 1024;

fn file_name_of(tarball: &Path) -> Result<String, String> {
    tarball
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| format!("cannot derive a file name from {}", tarball.display()))
}

async fn read_metadata(path: &Path) -> Result<PackageDocument, String> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_slice(&raw).map_err(|e| format!("invalid metadata in {}: {e}", path.display()))
}

pub async fn publish(
    db: &Database,
    name: &str,
    tarball: &Path,
    file: Option<&str>,
    metadata: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let file_name = match file {
        Some(f) => f.to_owned(),
        None => file_name_of(tarball)?,
    };
    let pkg = db.package(name);

    if let Some(path) = metadata {
        let doc = read_metadata(path).await?;
        match pkg.create_package(&doc).await {
            Ok(()) => info!("created metadata for {name}"),
            Err(e) if e.is_conflict() => debug!("{name} already has metadata, keeping it"),
            Err(e) => return Err(store_err(e)),
        }
    }

    let mut input = tokio::fs::File::open(tarball)
        .await
        .map_err(|e| format!("failed to open {}: {e}", tarball.display()))?;
    let mut writer = pkg.write_tarball(&file_name);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = input
            .read(&mut buf)
            .await
            .map_err(|e| format!("failed to read {}: {e}", tarball.display()))?;
        if n == 0 {
            break;
        }
        // A refused chunk means the pipeline stopped; finish() reports why.
        if writer.write(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            break;
        }
    }
    let report = writer.finish().await.map_err(store_err)?;
    db.add(name).await.map_err(store_err)?;

    for w in &report.warnings {
        warn!("{} was not mirrored: {}", w.key, w.error);
    }
    if json {
        let out = serde_json::json!({
            "key": report.key,
            "bytes": report.bytes,
            "companions": report
                .companions_uploaded
                .iter()
                .map(|c| c.file_name())
                .collect::<Vec<_>>(),
            "warnings": report
                .warnings
                .iter()
                .map(|w| serde_json::json!({"key": w.key, "error": w.error.to_string()}))
                .collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&out)?);
    } else {
        println!("published {} ({} bytes)", report.key, report.bytes);
        for c in &report.companions_uploaded {
            println!("  mirrored {c}");
        }
        for w in &report.warnings {
            println!("  warning: {c} not mirrored: {e}", c = w.file, e = w.error);
        }
    }
    Ok(EXIT_SUCCESS)
}

enum Sink {
    Stdout,
    File(tokio::fs::File),
}

impl Sink {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Stdout => std::io::stdout().lock().write_all(chunk),
            Sink::File(f) => f.write_all(chunk).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Stdout => std::io::stdout().lock().flush(),
            Sink::File(f) => f.flush().await,
        }
    }
}

pub async fn fetch(
    db: &Database,
    name: &str,
    file: &str,
    output: Option<&Path>,
) -> Result<u8, String> {
    let mut sink = match output {
        Some(path) => Sink::File(
            tokio::fs::File::create(path)
                .await
                .map_err(|e| format!("failed to create {}: {e}", path.display()))?,
        ),
        None => Sink::Stdout,
    };
    let result = stream_into(db, name, file, &mut sink).await;
    if result.is_err() {
        if let Some(path) = output {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
    result
}

async fn stream_into(db: &Database, name: &str, file: &str, sink: &mut Sink) -> Result<u8, String> {
    let mut reader = db.package(name).read_tarball(file);
    let mut received = 0u64;
    while let Some(event) = reader.next_event().await {
        match event {
            DownloadEvent::ContentLength(len) => debug!("{file}: {len} bytes"),
            DownloadEvent::Open => debug!("download of {file} started"),
            DownloadEvent::Data(chunk) => {
                received += chunk.len() as u64;
                sink.write(&chunk)
                    .await
                    .map_err(|e| format!("failed to write output: {e}"))?;
            }
            DownloadEvent::End => {
                sink.flush()
                    .await
                    .map_err(|e| format!("failed to write output: {e}"))?;
                info!("fetched {file} ({received} bytes)");
                return Ok(EXIT_SUCCESS);
            }
            DownloadEvent::Error(e) => return Err(store_err(e)),
        }
    }
    Err(format!("download of {file} ended unexpectedly"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_from_path() {
        assert_eq!(
            file_name_of(Path::new("/tmp/left-pad-1.0.0.tgz")).unwrap(),
            "left-pad-1.0.0.tgz"
        );
        assert!(file_name_of(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn metadata_must_be_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        std::fs::write(&path, "{").unwrap();
        assert!(read_metadata(&path).await.unwrap_err().contains("invalid metadata"));
        std::fs::write(&path, r#"{"name":"left-pad"}"#).unwrap();
        assert_eq!(read_metadata(&path).await.unwrap()["name"], "left-pad");
    }
}
