use crate::access::AccessRules;
use crate::StoreError;
use pkgbucket_remote::S3Config;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_TARBALL_ACL: &str = "private";
pub const DEFAULT_FALLBACK_REGISTRY: &str = "https://registry.npmjs.org";

/// Keys the environment may override, in the order they are applied.
pub const ENV_KEYS: &[&str] = &[
    "AWS_BUCKET",
    "AWS_KEY_PREFIX",
    "AWS_ENDPOINT",
    "AWS_REGION",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_TARBALL_ACL",
];

fn default_tarball_acl() -> String {
    DEFAULT_TARBALL_ACL.to_owned()
}

fn default_fallback_registry() -> String {
    DEFAULT_FALLBACK_REGISTRY.to_owned()
}

/// Store configuration, usually read from a TOML file and then overlaid with
/// `AWS_*` environment variables.
///
/// ```toml
/// bucket = "registry"
/// key_prefix = "npm"
/// endpoint = "http://minio:9000"
/// force_path_style = true
///
/// [[packages]]
/// pattern = "@internal/*"
/// storage = "private"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(flatten)]
    pub s3: S3Config,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default = "default_tarball_acl")]
    pub tarball_acl: String,
    /// Public registry consulted when a tarball is missing. Empty disables it.
    #[serde(default = "default_fallback_registry")]
    pub fallback_registry: String,
    /// Where incoming tarballs are staged. Defaults to the OS temp directory.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    #[serde(default)]
    pub packages: AccessRules,
}

impl StoreConfig {
    pub fn new(bucket: &str) -> Self {
        Self {
            s3: S3Config::new(bucket),
            key_prefix: String::new(),
            tarball_acl: default_tarball_acl(),
            fallback_registry: default_fallback_registry(),
            staging_dir: None,
            packages: AccessRules::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, StoreError> {
        toml::from_str(content).map_err(|e| StoreError::Config(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.s3.bucket.is_empty() {
            return Err(StoreError::Config("s3 storage requires a bucket".to_owned()));
        }
        Ok(())
    }

    /// Raw value of the field an `AWS_*` key refers to.
    fn field(&self, key: &str) -> Option<String> {
        let name = key.to_ascii_lowercase();
        let name = name.strip_prefix("aws_").unwrap_or(&name);
        let value = match name {
            "bucket" => Some(self.s3.bucket.clone()),
            "key_prefix" => Some(self.key_prefix.clone()),
            "endpoint" => self.s3.endpoint.clone(),
            "region" => self.s3.region.clone(),
            "access_key_id" => self.s3.access_key_id.clone(),
            "secret_access_key" => self.s3.secret_access_key.clone(),
            "session_token" => self.s3.session_token.clone(),
            "tarball_acl" => Some(self.tarball_acl.clone()),
            _ => None,
        };
        value.filter(|v| !v.is_empty())
    }

    fn set_field(&mut self, key: &str, value: Option<String>) {
        let name = key.to_ascii_lowercase();
        let name = name.strip_prefix("aws_").unwrap_or(&name);
        match name {
            "bucket" => self.s3.bucket = value.unwrap_or_default(),
            "key_prefix" => self.key_prefix = value.unwrap_or_default(),
            "endpoint" => self.s3.endpoint = value,
            "region" => self.s3.region = value,
            "access_key_id" => self.s3.access_key_id = value,
            "secret_access_key" => self.s3.secret_access_key = value,
            "session_token" => self.s3.session_token = value,
            "tarball_acl" => self.tarball_acl = value.unwrap_or_else(default_tarball_acl),
            _ => {}
        }
    }

    /// Overlay every [`ENV_KEYS`] entry from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for key in ENV_KEYS {
            let value = resolve_value_with(key, self, &lookup);
            self.set_field(key, value);
        }
    }
}

/// Effective value for `key`: the environment variable when set and
/// non-empty, else the config field it names (`AWS_KEY_PREFIX` → `key_prefix`).
pub fn resolve_value(key: &str, config: &StoreConfig) -> Option<String> {
    resolve_value_with(key, config, |k| std::env::var(k).ok())
}

pub fn resolve_value_with(
    key: &str,
    config: &StoreConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    lookup(key)
        .filter(|v| !v.is_empty())
        .or_else(|| config.field(key))
}
