use crate::access::{NoAccessRules, PackageAccess};
use crate::catalog::CATALOG_FILE;
use std::sync::Arc;

/// Append a `/` unless `path` already ends with one. Empty paths stay empty
/// so that an unset prefix never produces keys starting with `/`.
pub fn add_trailing_slash(path: &str) -> String {
    if path.is_empty() || path.ends_with('/') {
        path.to_owned()
    } else {
        format!("{path}/")
    }
}

fn join_segment(base: &str, segment: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        segment.trim_start_matches('/')
    )
}

/// Object key layout for the whole store.
///
/// ```text
/// <prefix>catalog.json
/// <prefix>[<subfolder>/]<pkg>/package.json
/// <prefix>[<subfolder>/]<pkg>/<file>
/// ```
///
/// The sub-folder comes from the access rules; the prefix is normalised to end
/// with `/` on construction.
#[derive(Clone)]
pub struct KeyLayout {
    prefix: String,
    access: Arc<dyn PackageAccess>,
}

impl KeyLayout {
    pub fn new(prefix: &str, access: Arc<dyn PackageAccess>) -> Self {
        Self {
            prefix: add_trailing_slash(prefix),
            access,
        }
    }

    /// Layout without access rules.
    pub fn flat(prefix: &str) -> Self {
        Self::new(prefix, Arc::new(NoAccessRules))
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    pub fn catalog_key(&self) -> String {
        format!("{}{CATALOG_FILE}", self.prefix)
    }

    /// Key prefix of everything stored for `package` (no trailing slash).
    pub fn package_path(&self, package: &str) -> String {
        match self.access.storage_folder(package) {
            Some(folder) => format!(
                "{}{}{package}",
                self.prefix,
                add_trailing_slash(folder.trim_start_matches('/'))
            ),
            None => format!("{}{package}", self.prefix),
        }
    }

    /// Key of `segments` under the package path, each joined by exactly one `/`.
    pub fn resolve(&self, package: &str, segments: &[&str]) -> String {
        segments
            .iter()
            .fold(self.package_path(package), |path, segment| {
                join_segment(&path, segment)
            })
    }
}

impl std::fmt::Debug for KeyLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLayout")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessRule, AccessRules};

    fn with_folder(prefix: &str, folder: &str) -> KeyLayout {
        KeyLayout::new(
            prefix,
            Arc::new(AccessRules::new(vec![AccessRule::new("**", Some(folder))])),
        )
    }

    #[test]
    fn trailing_slash_added_once() {
        assert_eq!(add_trailing_slash("registry"), "registry/");
        assert_eq!(add_trailing_slash("registry/"), "registry/");
        assert_eq!(add_trailing_slash(""), "");
    }

    #[test]
    fn prefix_is_normalised() {
        assert_eq!(KeyLayout::flat("registry").prefix(), "registry/");
        assert_eq!(KeyLayout::flat("registry/").prefix(), "registry/");
    }

    #[test]
    fn catalog_key_under_prefix() {
        assert_eq!(KeyLayout::flat("registry").catalog_key(), "registry/catalog.json");
        assert_eq!(KeyLayout::flat("").catalog_key(), "catalog.json");
    }

    #[test]
    fn default_package_path() {
        let layout = KeyLayout::flat("registry/");
        assert_eq!(layout.package_path("left-pad"), "registry/left-pad");
        assert_eq!(
            layout.resolve("left-pad", &["package.json"]),
            "registry/left-pad/package.json"
        );
    }

    #[test]
    fn override_folder_with_scoped_name() {
        let layout = with_folder("registry/", "foo");
        assert_eq!(
            layout.resolve("pkg@scope/x", &["file.json"]),
            "registry/foo/pkg@scope/x/file.json"
        );
    }

    #[test]
    fn override_folder_with_trailing_slash() {
        let layout = with_folder("registry", "foo/");
        assert_eq!(
            layout.resolve("pkg@scope/x", &["file.json"]),
            "registry/foo/pkg@scope/x/file.json"
        );
    }

    #[test]
    fn segments_joined_with_single_slash() {
        let layout = KeyLayout::flat("p/");
        assert_eq!(layout.resolve("a", &["b/", "c"]), "p/a/b/c");
        assert_eq!(layout.resolve("a", &["/b", "/c"]), "p/a/b/c");
        assert_eq!(layout.resolve("a", &[]), "p/a");
    }

    #[test]
    fn resolve_is_idempotent_under_normalisation() {
        let layout = with_folder("registry/", "foo");
        let once = layout.resolve("pkg", &["x.tgz"]);
        let again = join_segment(&layout.package_path("pkg"), "/x.tgz");
        assert_eq!(once, again);
    }

    #[test]
    fn override_folder_with_leading_slash() {
        let layout = with_folder("registry", "/foo");
        assert_eq!(layout.package_path("pkg"), "registry/foo/pkg");
        assert_eq!(
            with_folder("registry/", "/foo/").resolve("pkg", &["x.tgz"]),
            "registry/foo/pkg/x.tgz"
        );
    }
}
