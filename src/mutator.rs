//! File operations on managed archives
//!
//! Every operation validates the archive's current location, then performs
//! a single rename. The catalog is never touched here; callers re-scan.
//!
//! Sidecar preview images (`name.jpg` next to `name.vpk`) follow their archive.

use crate::layout::{Layout, Location};
use crate::paths;
use crate::progress::Progress;
use crate::tags;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Characters rejected in file names on at least one supported platform
const INVALID_NAME_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Target already exists: {0}")]
    TargetExists(PathBuf),

    #[error("Workshop archives must be moved to addons before they can be enabled or disabled: {0}")]
    WorkshopToggle(PathBuf),

    #[error("Not inside a managed directory: {0}")]
    Unmanaged(PathBuf),

    #[error("Cannot {operation} an archive in {location}")]
    InvalidState {
        operation: &'static str,
        location: Location,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("File is in use by another program: {0}")]
    InUse(PathBuf),

    #[error("Invalid file name: '{0}'")]
    InvalidName(String),

    #[error("No files selected")]
    NothingSelected,

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MutationError {
    /// Classify an I/O error raised while touching `path`
    pub fn from_io(path: &Path, source: std::io::Error) -> Self {
        use std::io::ErrorKind;

        if is_in_use(&source) {
            return MutationError::InUse(path.to_path_buf());
        }
        match source.kind() {
            ErrorKind::NotFound => MutationError::NotFound(path.to_path_buf()),
            ErrorKind::PermissionDenied => MutationError::PermissionDenied(path.to_path_buf()),
            ErrorKind::AlreadyExists => MutationError::TargetExists(path.to_path_buf()),
            _ => MutationError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

#[cfg(windows)]
fn is_in_use(err: &std::io::Error) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    matches!(err.raw_os_error(), Some(32) | Some(33))
}

#[cfg(not(windows))]
fn is_in_use(err: &std::io::Error) -> bool {
    // EBUSY, ETXTBSY
    matches!(err.raw_os_error(), Some(16) | Some(26))
}

pub type Result<T> = std::result::Result<T, MutationError>;

/// Outcome of a batch operation; never all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl BatchResult {
    pub fn record<T, E: std::fmt::Display>(&mut self, subject: &Path, result: std::result::Result<T, E>) {
        match result {
            Ok(_) => self.success += 1,
            Err(e) => {
                warn!("{}: {}", subject.display(), e);
                self.failed += 1;
                self.errors
                    .push(format!("{}: {}", paths::display_name(subject), e));
            }
        }
    }

    pub fn merge(&mut self, other: BatchResult) {
        self.success += other.success;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// Result of an export request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExportOutcome {
    /// No destination was chosen
    Cancelled,
    Exported {
        path: PathBuf,
        written: usize,
        skipped: usize,
    },
}

/// Performs file operations within one addons layout
#[derive(Debug, Clone)]
pub struct Mutator {
    layout: Layout,
}

impl Mutator {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn locate(&self, path: &Path) -> Result<Location> {
        if !path.is_file() {
            return Err(MutationError::NotFound(path.to_path_buf()));
        }
        self.layout
            .location_of(path)
            .ok_or_else(|| MutationError::Unmanaged(path.to_path_buf()))
    }

    /// Root -> disabled, disabled -> root
    pub fn toggle(&self, path: &Path) -> Result<PathBuf> {
        match self.locate(path)? {
            Location::Root => self.relocate(path, Location::Disabled),
            Location::Disabled => self.relocate(path, Location::Root),
            Location::Workshop => Err(MutationError::WorkshopToggle(path.to_path_buf())),
        }
    }

    pub fn enable(&self, path: &Path) -> Result<PathBuf> {
        match self.locate(path)? {
            Location::Disabled => self.relocate(path, Location::Root),
            Location::Workshop => Err(MutationError::WorkshopToggle(path.to_path_buf())),
            location => Err(MutationError::InvalidState {
                operation: "enable",
                location,
            }),
        }
    }

    pub fn disable(&self, path: &Path) -> Result<PathBuf> {
        match self.locate(path)? {
            Location::Root => self.relocate(path, Location::Disabled),
            Location::Workshop => Err(MutationError::WorkshopToggle(path.to_path_buf())),
            location => Err(MutationError::InvalidState {
                operation: "disable",
                location,
            }),
        }
    }

    /// Move a workshop archive into the addons root, enabling it
    pub fn move_workshop_to_addons(&self, path: &Path) -> Result<PathBuf> {
        match self.locate(path)? {
            Location::Workshop => self.relocate(path, Location::Root),
            location => Err(MutationError::InvalidState {
                operation: "move to addons",
                location,
            }),
        }
    }

    /// Move an archive to the trash directory under a timestamped name
    pub fn delete(&self, path: &Path) -> Result<PathBuf> {
        self.locate(path)?;
        let trash = &self.layout.trash;
        std::fs::create_dir_all(trash).map_err(|e| MutationError::from_io(trash, e))?;

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let name = format!("{}_{}", stamp, paths::display_name(path));
        let target = paths::unique_path(trash, &name);
        move_with_sidecars(path, &target)?;
        info!("Moved {} to trash", path.display());
        Ok(target)
    }

    /// Rename within the same directory.
    ///
    /// Tags carried by the old name survive when the new name has none, and
    /// `.vpk` is appended when missing.
    pub fn rename(&self, path: &Path, new_name: &str) -> Result<PathBuf> {
        self.locate(path)?;
        let new_name = validate_name(new_name)?;

        let prefix = &self.layout.hidden_prefix;
        let old_name = paths::display_name(path);
        let old = tags::split_name(&old_name, prefix);
        let new = tags::split_name(new_name, prefix);

        let mut final_name = match (&old.tags, &new.tags) {
            (Some(kept), None) => tags::compose_name(
                new.hidden.then_some(prefix.as_str()),
                &kept.primary,
                &kept.secondary,
                new.body,
            ),
            _ => new_name.to_string(),
        };
        if !paths::is_vpk(Path::new(&final_name)) {
            final_name.push_str(".vpk");
        }

        self.rename_in_place(path, &final_name)
    }

    /// Add or remove the hidden prefix
    pub fn toggle_visibility(&self, path: &Path) -> Result<PathBuf> {
        self.locate(path)?;
        let name = paths::display_name(path);
        let prefix = &self.layout.hidden_prefix;
        let new_name = match name.strip_prefix(prefix.as_str()) {
            Some(rest) => rest.to_string(),
            None => format!("{}{}", prefix, name),
        };
        validate_name(&new_name)?;
        self.rename_in_place(path, &new_name)
    }

    /// Hide if visible; already hidden archives are left alone
    pub fn hide(&self, path: &Path) -> Result<PathBuf> {
        self.locate(path)?;
        if self.layout.is_hidden(&paths::display_name(path)) {
            return Ok(path.to_path_buf());
        }
        self.toggle_visibility(path)
    }

    /// Rewrite the `[tags]` block of the file name; empty tags remove it
    pub fn set_tags(&self, path: &Path, primary: &str, secondary: &[String]) -> Result<PathBuf> {
        self.locate(path)?;
        let prefix = &self.layout.hidden_prefix;
        let name = paths::display_name(path);
        let split = tags::split_name(&name, prefix);
        let new_name = tags::compose_name(
            split.hidden.then_some(prefix.as_str()),
            primary,
            secondary,
            split.body,
        );
        validate_name(&new_name)?;
        self.rename_in_place(path, &new_name)
    }

    pub fn toggle_many(&self, paths: &[PathBuf]) -> BatchResult {
        self.batch(paths, |p| self.toggle(p))
    }

    pub fn enable_many(&self, paths: &[PathBuf]) -> BatchResult {
        self.batch(paths, |p| self.enable(p))
    }

    pub fn disable_many(&self, paths: &[PathBuf]) -> BatchResult {
        self.batch(paths, |p| self.disable(p))
    }

    pub fn delete_many(&self, paths: &[PathBuf]) -> BatchResult {
        self.batch(paths, |p| self.delete(p))
    }

    pub fn hide_many(&self, paths: &[PathBuf]) -> BatchResult {
        self.batch(paths, |p| self.hide(p))
    }

    /// Apply `op` to every path, continuing past failures
    pub fn batch<F>(&self, paths: &[PathBuf], mut op: F) -> BatchResult
    where
        F: FnMut(&Path) -> Result<PathBuf>,
    {
        let mut result = BatchResult::default();
        for path in paths {
            result.record(path, op(path));
        }
        info!(
            "Batch complete: {} succeeded, {} failed",
            result.success, result.failed
        );
        result
    }

    fn relocate(&self, path: &Path, to: Location) -> Result<PathBuf> {
        let dir = self.layout.dir_for(to);
        std::fs::create_dir_all(dir).map_err(|e| MutationError::from_io(dir, e))?;
        let target = dir.join(paths::display_name(path));
        move_with_sidecars(path, &target)?;
        info!("Moved {} -> {}", path.display(), target.display());
        Ok(target)
    }

    fn rename_in_place(&self, path: &Path, new_name: &str) -> Result<PathBuf> {
        let target = path.with_file_name(new_name);
        if target == path {
            return Ok(target);
        }
        // Case-only renames hit the same file on case-insensitive filesystems
        let case_only = paths::display_name(path).eq_ignore_ascii_case(new_name);
        if case_only {
            std::fs::rename(path, &target).map_err(|e| MutationError::from_io(path, e))?;
            move_sidecars(path, &target);
        } else {
            move_with_sidecars(path, &target)?;
        }
        info!("Renamed {} -> {}", path.display(), new_name);
        Ok(target)
    }

    /// Write `files` into a new zip at `dest` with flat entry names.
    ///
    /// Unreadable files are skipped and counted. `None` means the user
    /// cancelled the destination prompt.
    pub fn export_zip(
        &self,
        files: &[PathBuf],
        dest: Option<&Path>,
        progress: Option<&(dyn Fn(Progress) + Sync)>,
    ) -> Result<ExportOutcome> {
        let Some(dest) = dest else {
            return Ok(ExportOutcome::Cancelled);
        };
        if files.is_empty() {
            return Err(MutationError::NothingSelected);
        }

        paths::ensure_parent_dirs(dest).map_err(|e| MutationError::from_io(dest, e))?;
        let out = File::create(dest).map_err(|e| MutationError::from_io(dest, e))?;
        let mut zip = zip::ZipWriter::new(BufWriter::new(out));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(true);

        let total = files.len();
        let mut written = 0;
        let mut skipped = 0;
        let mut used = HashSet::new();

        for (i, file) in files.iter().enumerate() {
            let name = paths::display_name(file);
            if let Some(cb) = progress {
                cb(Progress::new(i + 1, total, format!("Exporting {}", name)));
            }

            let mut reader = match File::open(file) {
                Ok(f) => BufReader::new(f),
                Err(e) => {
                    warn!("Skipping {}: {}", file.display(), e);
                    skipped += 1;
                    continue;
                }
            };

            let entry = entry_name(&self.layout, file, &name, &used);
            if let Err(e) = zip.start_file(entry.as_str(), options) {
                warn!("Skipping {}: {}", file.display(), e);
                skipped += 1;
                continue;
            }
            match std::io::copy(&mut reader, &mut zip) {
                Ok(bytes) => {
                    debug!("Exported {} as {} ({} bytes)", file.display(), entry, bytes);
                    used.insert(entry.to_lowercase());
                    written += 1;
                }
                Err(e) => {
                    warn!("Failed to export {}: {}", file.display(), e);
                    if let Err(e) = zip.abort_file() {
                        warn!("Failed to drop partial entry {}: {}", entry, e);
                    }
                    skipped += 1;
                }
            }
        }

        zip.finish().map_err(|e| MutationError::Io {
            path: dest.to_path_buf(),
            source: std::io::Error::other(e),
        })?;

        if written == 0 {
            if let Err(e) = std::fs::remove_file(dest) {
                warn!("Failed to remove empty export {}: {}", dest.display(), e);
            }
            return Err(MutationError::NothingSelected);
        }

        info!("Exported {} files to {} ({} skipped)", written, dest.display(), skipped);
        Ok(ExportOutcome::Exported {
            path: dest.to_path_buf(),
            written,
            skipped,
        })
    }
}

/// Flat entry name, suffixed with the location (then a counter) when taken
fn entry_name(layout: &Layout, file: &Path, name: &str, used: &HashSet<String>) -> String {
    if !used.contains(&name.to_lowercase()) {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{}", ext)),
        _ => (name, String::new()),
    };
    let location = layout
        .location_of(file)
        .map(|l| l.to_string())
        .unwrap_or_else(|| "copy".to_string());

    let mut candidate = format!("{} ({}){}", stem, location, ext);
    let mut n = 2;
    while used.contains(&candidate.to_lowercase()) {
        candidate = format!("{} ({} {}){}", stem, location, n, ext);
        n += 1;
    }
    candidate
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(INVALID_NAME_CHARS)
        || name.chars().any(char::is_control)
    {
        return Err(MutationError::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Rename `from` to `to`, refusing to overwrite; sidecars follow
fn move_with_sidecars(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        return Err(MutationError::TargetExists(to.to_path_buf()));
    }
    std::fs::rename(from, to).map_err(|e| MutationError::from_io(from, e))?;
    move_sidecars(from, to);
    Ok(())
}

/// Best effort: a stuck sidecar must not undo the archive move
fn move_sidecars(from: &Path, to: &Path) {
    for sidecar in paths::existing_sidecars(from) {
        let Some(ext) = sidecar.extension() else {
            continue;
        };
        let target = to.with_extension(ext);
        if target.exists() {
            warn!("Leaving sidecar {}: {} exists", sidecar.display(), target.display());
            continue;
        }
        if let Err(e) = std::fs::rename(&sidecar, &target) {
            warn!("Failed to move sidecar {}: {}", sidecar.display(), e);
        }
    }
}
