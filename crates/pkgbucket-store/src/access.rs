use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tracing::warn;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Access-control lookup consumed by the key layout.
///
/// Hosts with their own rule engine implement this; [`AccessRules`] covers the
/// common case of an ordered list of glob patterns from configuration.
pub trait PackageAccess: Send + Sync {
    /// Custom storage sub-folder for `package`, if its rule defines one.
    fn storage_folder(&self, package: &str) -> Option<String>;
}

/// No rules: every package lives directly under the key prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccessRules;

impl PackageAccess for NoAccessRules {
    fn storage_folder(&self, _package: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRule {
    /// Glob over package names: `**` matches anything, `*` anything but `/`.
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

impl AccessRule {
    pub fn new(pattern: &str, storage: Option<&str>) -> Self {
        Self {
            pattern: pattern.to_owned(),
            storage: storage.map(str::to_owned),
        }
    }

    /// An invalid pattern matches nothing.
    pub fn matches(&self, package: &str) -> bool {
        match Pattern::new(&self.pattern) {
            Ok(pattern) => pattern.matches_with(package, MATCH_OPTIONS),
            Err(e) => {
                warn!("ignoring invalid package pattern {:?}: {e}", self.pattern);
                false
            }
        }
    }
}

/// Ordered rule list; the first rule matching a package decides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AccessRules(pub Vec<AccessRule>);

impl AccessRules {
    pub fn new(rules: Vec<AccessRule>) -> Self {
        Self(rules)
    }

    pub fn matched(&self, package: &str) -> Option<&AccessRule> {
        self.0.iter().find(|rule| rule.matches(package))
    }
}

impl PackageAccess for AccessRules {
    fn storage_folder(&self, package: &str) -> Option<String> {
        self.matched(package)
            .and_then(|rule| rule.storage.clone())
            .filter(|s| !s.is_empty())
    }
}
