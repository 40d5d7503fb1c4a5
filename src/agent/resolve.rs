//! Trusted entry-point resolution.
//!
//! Agent executables are only ever launched from inside a trusted root: the
//! installed-plugins root first, then the bundled-templates root. Anything
//! that could step outside those roots (`..` segments, absolute paths that do
//! not canonicalize into a root, symlinks pointing elsewhere) fails closed.

use crate::error::SpawnError;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Resolve `raw` to a canonical file inside one of `roots` (searched in order).
pub fn resolve_entry_point(raw: &str, roots: &[PathBuf]) -> Result<PathBuf, SpawnError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(not_found(raw, roots));
    }

    if trimmed.split(['/', '\\']).any(|segment| segment == "..") {
        warn!(path = %raw, "rejecting entry point with '..' segment");
        return Err(SpawnError::Traversal(raw.to_string()));
    }

    let canonical_roots: Vec<PathBuf> = roots
        .iter()
        .filter_map(|root| root.canonicalize().ok())
        .collect();

    if looks_absolute(trimmed) {
        let path = Path::new(trimmed);
        if !path.is_file() {
            return Err(not_found(raw, roots));
        }
        let canonical = path.canonicalize().map_err(|_| not_found(raw, roots))?;
        if canonical_roots.iter().any(|root| canonical.starts_with(root)) {
            return Ok(canonical);
        }
        warn!(path = %raw, "rejecting absolute entry point outside trusted roots");
        return Err(SpawnError::Traversal(raw.to_string()));
    }

    for root in &canonical_roots {
        let candidate = root.join(trimmed);
        if !candidate.is_file() {
            continue;
        }
        let canonical = candidate
            .canonicalize()
            .map_err(|_| not_found(raw, roots))?;
        if canonical.starts_with(root) {
            return Ok(canonical);
        }
        // Found, but a symlink leads out of the root it was found in.
        warn!(path = %raw, root = %root.display(), target = %canonical.display(), "entry point escapes its root");
        return Err(SpawnError::Traversal(raw.to_string()));
    }

    Err(not_found(raw, roots))
}

/// POSIX absolute, UNC or backslash-rooted, or drive-letter paths.
fn looks_absolute(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn not_found(raw: &str, roots: &[PathBuf]) -> SpawnError {
    SpawnError::NotFound {
        path: raw.to_string(),
        roots: roots
            .iter()
            .map(|r| r.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    }
}
