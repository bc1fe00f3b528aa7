//! Source tree filtering for uploads and tarballs

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};

/// Ignore file read from the root of an uploaded tree
pub const IGNORE_FILE: &str = ".keepsakeignore";

/// Directory names never uploaded, at any depth
pub const DENYLIST: [&str; 5] = [".keepsake", ".replicate", ".git", "venv", ".mypy_cache"];

/// Decides which paths under a source root are uploaded
///
/// Combines the fixed directory denylist with `.gitignore`-style patterns
/// from the root's `.keepsakeignore`.
#[derive(Debug)]
pub struct PathFilter {
    ignore: Gitignore,
}

impl PathFilter {
    /// Load the ignore rules for `root`
    ///
    /// A missing ignore file means nothing beyond the denylist is excluded.
    /// Malformed patterns are skipped with a warning.
    pub fn load(root: &Path) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        let ignore_path = root.join(IGNORE_FILE);
        if ignore_path.is_file() {
            if let Some(e) = builder.add(&ignore_path) {
                warn!(path = %ignore_path.display(), error = %e, "Skipping invalid ignore patterns");
            } else {
                debug!(path = %ignore_path.display(), "Loaded ignore file");
            }
        }

        let ignore = builder.build().unwrap_or_else(|e| {
            warn!(root = %root.display(), error = %e, "Ignore rules unusable, uploading everything");
            Gitignore::empty()
        });
        Self { ignore }
    }

    /// Returns true if `relative` (a path under the root) should be skipped
    pub fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool {
        if relative.as_os_str().is_empty() {
            return false;
        }
        if is_dir && is_denylisted(relative) {
            return true;
        }
        self.ignore
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }
}

fn is_denylisted(relative: &Path) -> bool {
    relative
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| DENYLIST.contains(&name))
        .unwrap_or(false)
}
