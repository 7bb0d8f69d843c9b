//! Path helpers shared by the scanner, conflict checker and mutator
//!
//! VPK trees store their entries as `dir/name.ext` with forward slashes,
//! but addon authors are sloppy about case and occasionally about separators.
//! This module handles:
//! - Normalizing internal paths for comparisons (lowercase, forward slashes)
//! - Recognizing `.vpk` files regardless of extension case
//! - Locating sidecar preview images next to an archive

use std::path::{Path, PathBuf};

/// Image extensions accepted as sidecar previews, in lookup order
pub const SIDECAR_EXTENSIONS: [&str; 3] = ["jpg", "png", "jpeg"];

/// Normalize a path for lookups and comparisons (lowercase, forward slashes, trimmed)
pub fn normalize_for_lookup(path: &str) -> String {
    path.trim()
        .to_lowercase()
        .replace('\\', "/")
        .trim_matches('/')
        .to_string()
}

/// Build the full internal path of a VPK tree entry.
///
/// A single space is the tree's encoding of "no directory" / "no extension".
pub fn join_entry_path(dir: &str, name: &str, ext: &str) -> String {
    let mut path = String::with_capacity(dir.len() + name.len() + ext.len() + 2);
    if !dir.is_empty() && dir != " " {
        path.push_str(dir.trim_matches('/'));
        path.push('/');
    }
    path.push_str(name);
    if !ext.is_empty() && ext != " " {
        path.push('.');
        path.push_str(ext);
    }
    path
}

/// Get the filename from a path (handles both / and \)
pub fn file_name(path: &str) -> &str {
    path.rfind(['\\', '/'])
        .map(|idx| &path[idx + 1..])
        .unwrap_or(path)
}

/// Get file extension (as written, no dot)
pub fn extension(path: &str) -> Option<&str> {
    let name = file_name(path);
    name.rfind('.').map(|idx| &name[idx + 1..])
}

/// Check an on-disk path for an extension, ignoring case
pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// True for `*.vpk` in any case
pub fn is_vpk(path: &Path) -> bool {
    has_extension(path, "vpk")
}

/// Display name of an on-disk file
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Candidate sidecar image paths for an archive (`foo.vpk` -> `foo.jpg`, ...)
pub fn sidecar_candidates(archive: &Path) -> Vec<PathBuf> {
    SIDECAR_EXTENSIONS
        .iter()
        .map(|ext| archive.with_extension(ext))
        .collect()
}

/// Existing sidecar images for an archive
pub fn existing_sidecars(archive: &Path) -> Vec<PathBuf> {
    sidecar_candidates(archive)
        .into_iter()
        .filter(|p| p.is_file())
        .collect()
}

/// Pick a file name inside `dir` that does not exist yet.
///
/// `name.vpk` becomes `name (1).vpk`, `name (2).vpk`, ... on collision.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };

    (1u32..)
        .map(|n| dir.join(format!("{} ({}){}", stem, n, ext)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
