//! Path normalization for index keys.

use std::path::{Component, Path, PathBuf};

/// Cleans a path so that equivalent spellings share one index key.
///
/// Collapses `.` components, squeezes repeated separators and drops trailing
/// separators, so `./x`, `x/` and `x` all map to `x`. `..` components are
/// kept as-is; resolving them would require touching the filesystem.
pub(crate) fn clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            other => cleaned.push(other),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

/// The cleaned path of the directory containing `path`, used as the key of
/// the per-directory index. A bare relative component lives in `.`; a root
/// maps to itself.
pub(crate) fn parent(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => path.to_path_buf(),
    }
}
