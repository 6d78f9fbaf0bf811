//! File-root helpers: base-name sanitizing and lookups under a root directory.

use std::path::{Path, PathBuf};

/// Reduce a requested name to its final path component. Returns `None` for
/// names with no usable component (empty, `.`, `..`, trailing separator).
pub fn sanitize_name(requested: &str) -> Option<String> {
    let base = requested
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return None;
    }
    Some(base.to_string())
}

/// Path of an existing regular file named `requested` directly under `root`.
pub async fn resolve_existing(root: &Path, requested: &str) -> Option<PathBuf> {
    let name = sanitize_name(requested)?;
    let path = root.join(name);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Some(path),
        _ => None,
    }
}

/// Create `dir` (and parents) if missing.
pub async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}
