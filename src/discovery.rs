//! Test script discovery.
//!
//! A test unit is a single script whose file name ends with the configured
//! suffix (`_test.py` by default). Discovery accepts either one script or a
//! directory, which is walked recursively.
//!
//! # Ordering
//!
//! Directory entries are visited sorted by file name, so the order of the
//! returned units is stable for a given tree on every platform. Within a
//! device queue this order becomes the execution order.
//!
//! # Example
//!
//! ```no_run
//! use fleetrun::discovery::discover;
//! use std::path::Path;
//!
//! let units = discover(Path::new("tests"), "_test.py")?;
//! for unit in &units {
//!     println!("{} -> {}", unit.base_name, unit.path.display());
//! }
//! # Ok::<(), fleetrun::discovery::DiscoveryError>(())
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur while discovering test scripts.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The root path is neither a file nor a directory.
    #[error("Test path does not exist: {0}")]
    NotFound(PathBuf),

    /// Walking the directory tree failed part way.
    #[error("Failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// One schedulable test script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestUnit {
    /// Location of the script.
    pub path: PathBuf,

    /// File stem of the script, e.g. `login_test` for `login_test.py`.
    pub base_name: String,
}

impl TestUnit {
    /// Creates a unit for `path`, deriving `base_name` from the file stem.
    ///
    /// # Example
    ///
    /// ```
    /// use fleetrun::discovery::TestUnit;
    ///
    /// let unit = TestUnit::new("suite/login_test.py");
    /// assert_eq!(unit.base_name, "login_test");
    /// ```
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let base_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self { path, base_name }
    }

    /// Returns true if any component of the script path equals `segment`.
    pub fn has_path_segment(&self, segment: &str) -> bool {
        self.path
            .components()
            .any(|c| c.as_os_str().to_string_lossy() == segment)
    }
}

fn matches_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(suffix))
        .unwrap_or(false)
}

/// Finds every test script under `root`.
///
/// - `root` is a file: returned alone if its name ends with `suffix`,
///   otherwise the result is empty.
/// - `root` is a directory: every matching file below it, recursively.
///
/// # Errors
///
/// [`DiscoveryError::NotFound`] if `root` does not exist and
/// [`DiscoveryError::Walk`] if the walk hits an unreadable entry.
pub fn discover(root: &Path, suffix: &str) -> DiscoveryResult<Vec<TestUnit>> {
    if root.is_file() {
        if matches_suffix(root, suffix) {
            return Ok(vec![TestUnit::new(root)]);
        }
        warn!(
            "{} does not end with '{}', nothing to run",
            root.display(),
            suffix
        );
        return Ok(Vec::new());
    }

    if !root.is_dir() {
        return Err(DiscoveryError::NotFound(root.to_path_buf()));
    }

    let mut units = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| DiscoveryError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file() && matches_suffix(entry.path(), suffix) {
            units.push(TestUnit::new(entry.path()));
        }
    }

    debug!("Discovered {} scripts under {}", units.len(), root.display());
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "# script\n").unwrap();
    }

    #[test]
    fn test_single_matching_file() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("login_test.py");
        touch(&script);

        let units = discover(&script, "_test.py").unwrap();
        assert_eq!(units, vec![TestUnit::new(&script)]);
        assert_eq!(units[0].base_name, "login_test");
    }

    #[test]
    fn test_single_non_matching_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let helper = dir.path().join("helpers.py");
        touch(&helper);

        assert!(discover(&helper, "_test.py").unwrap().is_empty());
    }

    #[test]
    fn test_directory_is_walked_recursively_in_name_order() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("b_test.py"));
        touch(&dir.path().join("a_test.py"));
        touch(&dir.path().join("nested/deeper/c_test.py"));
        touch(&dir.path().join("nested/util.py"));
        touch(&dir.path().join("readme_test.txt"));

        let names: Vec<_> = discover(dir.path(), "_test.py")
            .unwrap()
            .into_iter()
            .map(|u| u.base_name)
            .collect();
        assert_eq!(names, vec!["a_test", "b_test", "c_test"]);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = discover(&dir.path().join("nope"), "_test.py").unwrap_err();
        assert!(matches!(err, DiscoveryError::NotFound(_)));
    }

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        assert!(discover(dir.path(), "_test.py").unwrap().is_empty());
    }

    #[test]
    fn test_has_path_segment_matches_whole_components_only() {
        let unit = TestUnit::new("suites/YWT0222A10000129/pay_test.py");
        assert!(unit.has_path_segment("YWT0222A10000129"));
        assert!(!unit.has_path_segment("YWT0222"));
        assert!(!unit.has_path_segment("pay"));
    }
}
