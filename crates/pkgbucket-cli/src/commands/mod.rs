pub mod catalog;
pub mod package;
pub mod tarball;

use pkgbucket_store::{StoreConfig, StoreError};
use std::path::Path;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// CLI message for a store failure. Configuration problems keep their own
/// prefix so they map to a distinct exit code.
pub fn store_err(e: StoreError) -> String {
    match e {
        StoreError::Config(_) => e.to_string(),
        other => format!("store error ({}): {other}", other.status()),
    }
}

/// Config file if present, then `AWS_*` environment, then `--bucket`.
pub fn load_config(path: &Path, bucket: Option<&str>) -> Result<StoreConfig, String> {
    let mut config = if path.exists() {
        debug!("loading config from {}", path.display());
        StoreConfig::load(path).map_err(store_err)?
    } else {
        debug!("no config at {}, using environment only", path.display());
        StoreConfig::new("")
    };
    config.apply_env();
    if let Some(bucket) = bucket {
        config.s3.bucket = bucket.to_owned();
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_names() {
        let out = json_pretty(&vec!["left-pad", "@fleet/core"]).unwrap();
        assert!(out.contains("\"left-pad\""));
        assert!(out.contains("\"@fleet/core\""));
    }

    #[test]
    fn store_errors_carry_status() {
        assert_eq!(
            store_err(StoreError::not_found()),
            "store error (404): not found: no such package available"
        );
        assert!(store_err(StoreError::Config("s3 storage requires a bucket".into()))
            .starts_with("configuration error:"));
    }

    #[test]
    fn config_file_then_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkgbucket.toml");
        std::fs::write(&path, "bucket = \"from-file\"\nkey_prefix = \"npm\"\n").unwrap();
        let config = load_config(&path, Some("from-flag")).unwrap();
        assert_eq!(config.s3.bucket, "from-flag");
    }

    #[test]
    fn invalid_config_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkgbucket.toml");
        std::fs::write(&path, "bucket = [").unwrap();
        let err = load_config(&path, None).unwrap_err();
        assert!(err.starts_with("configuration error:"));
    }
}
