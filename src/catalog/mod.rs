//! Archive catalog
//!
//! Holds every `.vpk` found in the managed directories together with its
//! parsed metadata. Parse results are cached by identity key (path, size,
//! mtime) so repeated scans only touch files that changed.
//!
//! Readers get a cheap `Arc` of the current snapshot; a scan builds a new
//! snapshot off to the side and swaps it in at the end.

pub mod search;

use crate::config::ConfigError;
use crate::layout::{Layout, Location};
use crate::paths;
use crate::tags;
use crate::vpk::metadata::{self, ParsedMetadata, PreviewImage, PrimaryTag};
use crate::vpk::{preview, ArchiveParser, ParseError, ParsedArchive};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Cache validity key of an archive file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl IdentityKey {
    /// Read the key from disk; `None` if the file is gone
    pub fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }
}

/// Parse result as kept in the cache
#[derive(Debug, Clone)]
struct CachedParse {
    metadata: metadata::BasicMetadata,
    listing: Arc<[String]>,
    embedded_preview: Option<String>,
}

impl From<ParsedArchive> for CachedParse {
    fn from(parsed: ParsedArchive) -> Self {
        Self {
            metadata: parsed.metadata,
            listing: parsed.listing.into(),
            embedded_preview: parsed.embedded_preview,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    key: IdentityKey,
    result: Result<CachedParse, ParseError>,
}

/// One physical archive file
#[derive(Debug, Clone, Serialize)]
pub struct Archive {
    pub path: PathBuf,
    /// File name including any hidden prefix and tag block
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub location: Location,
    enabled: bool,
    pub hidden: bool,
    pub metadata: ParsedMetadata,
    pub preview: Option<PreviewImage>,
    /// Why parsing failed, when `metadata` is `None`
    pub parse_error: Option<String>,
    /// Internal paths, shared with the cache
    #[serde(skip)]
    pub listing: Arc<[String]>,
}

impl Archive {
    /// Bare archive record at `path`; enabled follows from `location`
    pub fn new(path: impl Into<PathBuf>, location: Location) -> Self {
        let path = path.into();
        let name = paths::display_name(&path);
        Self {
            path,
            name,
            size: 0,
            modified: DateTime::<Utc>::from(SystemTime::UNIX_EPOCH),
            location,
            enabled: location.is_enabled(),
            hidden: false,
            metadata: ParsedMetadata::None,
            preview: None,
            parse_error: None,
            listing: Arc::from(Vec::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn title(&self) -> &str {
        self.metadata.title()
    }
}

/// Immutable view of the catalog after a scan
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    archives: Vec<Archive>,
}

impl CatalogSnapshot {
    /// All archives, sorted by path
    pub fn archives(&self) -> &[Archive] {
        &self.archives
    }

    pub fn get(&self, path: &Path) -> Option<&Archive> {
        self.archives.iter().find(|a| a.path == path)
    }

    /// Find an archive by file name (case-insensitive)
    pub fn find_by_name(&self, name: &str) -> Option<&Archive> {
        self.archives
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Primary tags present, in vocabulary order
    pub fn primary_tags(&self) -> Vec<PrimaryTag> {
        let present: HashSet<PrimaryTag> = self
            .archives
            .iter()
            .filter_map(|a| a.metadata.primary_tag())
            .collect();
        PrimaryTag::ALL
            .into_iter()
            .filter(|t| present.contains(t))
            .collect()
    }

    /// Secondary tags used under `primary` (all archives when `None`), sorted
    pub fn secondary_tags(&self, primary: Option<PrimaryTag>) -> Vec<String> {
        let tags: BTreeSet<&str> = self
            .archives
            .iter()
            .filter(|a| primary.is_none() || a.metadata.primary_tag() == primary)
            .flat_map(|a| a.metadata.secondary_tags().iter().map(String::as_str))
            .collect();
        let mut tags: Vec<String> = tags.into_iter().map(str::to_string).collect();
        tags.sort_by(|a, b| search::natural_cmp(a, b));
        tags
    }
}

/// Outcome of one scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Archives in the catalog after the scan
    pub total: usize,
    /// Archives handed to the parser
    pub parsed: usize,
    /// Archives served from the cache
    pub cached: usize,
    /// Cache entries dropped because their file is gone
    pub removed: usize,
    /// Parse failures among the newly parsed archives
    pub errors: Vec<ParseError>,
}

/// Progress callback: `(current, total)`
pub type ScanProgress<'a> = &'a (dyn Fn(usize, usize) + Sync);

/// The archive catalog for one addons root
pub struct Catalog {
    layout: Layout,
    parser: Arc<dyn ArchiveParser>,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    scan_lock: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Catalog {
    pub fn new(layout: Layout, parser: Arc<dyn ArchiveParser>) -> Self {
        Self {
            layout,
            parser,
            cache: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
            scan_lock: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Current snapshot; stays valid while later scans run
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Rebuild the catalog from disk
    pub fn scan(&self, progress: Option<ScanProgress<'_>>) -> Result<ScanReport, ConfigError> {
        let _guard = lock(&self.scan_lock);

        let files = self.discover()?;
        let total = files.len();

        // Split into cache hits and files needing a parse
        let mut report = ScanReport::default();
        let mut fresh: Vec<(Location, CacheEntry)> = Vec::with_capacity(total);
        let mut stale: Vec<(Location, IdentityKey)> = Vec::new();
        {
            let cache = lock(&self.cache);
            for (location, key) in files {
                match cache.get(&key.path) {
                    Some(entry) if entry.key == key => fresh.push((location, entry.clone())),
                    _ => stale.push((location, key)),
                }
            }
        }
        report.cached = fresh.len();
        report.parsed = stale.len();

        let done = AtomicUsize::new(report.cached);
        if let Some(cb) = progress {
            cb(report.cached, total);
        }

        // Parse outside any lock
        let parser = &self.parser;
        let parsed: Vec<(Location, CacheEntry)> = stale
            .into_par_iter()
            .filter_map(|(location, key)| {
                let result = parser.parse(&key.path).map(CachedParse::from);
                let current = done.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(cb) = progress {
                    cb(current, total);
                }
                if result.is_err() && !key.path.exists() {
                    debug!("{} vanished during scan", key.path.display());
                    return None;
                }
                Some((location, CacheEntry { key, result }))
            })
            .collect();

        for (_, entry) in &parsed {
            if let Err(err) = &entry.result {
                warn!("Failed to parse {}", err);
                report.errors.push(err.clone());
            }
        }
        report.parsed = parsed.len();

        let mut entries = fresh;
        entries.extend(parsed);

        {
            let mut cache = lock(&self.cache);
            for (_, entry) in &entries {
                cache.insert(entry.key.path.clone(), entry.clone());
            }
            let live: HashSet<&PathBuf> = entries.iter().map(|(_, e)| &e.key.path).collect();
            let before = cache.len();
            cache.retain(|path, _| live.contains(path));
            report.removed = before - cache.len();
        }

        let mut archives: Vec<Archive> = entries
            .iter()
            .map(|(location, entry)| self.build_archive(*location, entry))
            .collect();
        archives.sort_by(|a, b| a.path.cmp(&b.path));
        report.total = archives.len();

        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(CatalogSnapshot { archives });

        info!(
            "Scan complete: {} archives ({} parsed, {} cached, {} removed, {} errors)",
            report.total,
            report.parsed,
            report.cached,
            report.removed,
            report.errors.len()
        );
        Ok(report)
    }

    /// List `*.vpk` files in the three managed directories
    fn discover(&self) -> Result<Vec<(Location, IdentityKey)>, ConfigError> {
        let mut files = Vec::new();
        for (location, dir) in self.layout.scan_dirs() {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if location == Location::Root {
                        return Err(ConfigError::DirectoryNotFound(dir.to_path_buf()));
                    }
                    continue;
                }
                Err(e) => {
                    return Err(ConfigError::Inaccessible {
                        path: dir.to_path_buf(),
                        reason: e.to_string(),
                    })
                }
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if !paths::is_vpk(&path) {
                    continue;
                }
                if let Some(key) = IdentityKey::of(&path) {
                    files.push((location, key));
                }
            }
        }
        Ok(files)
    }

    fn build_archive(&self, location: Location, entry: &CacheEntry) -> Archive {
        let path = &entry.key.path;
        let mut archive = Archive::new(path.clone(), location);
        archive.size = entry.key.size;
        archive.modified = DateTime::<Utc>::from(entry.key.modified);
        archive.hidden = self.layout.is_hidden(&archive.name);

        match &entry.result {
            Ok(parsed) => {
                let mut meta = parsed.metadata.clone();
                let split = tags::split_name(&archive.name, &self.layout.hidden_prefix);
                if let Some(tags) = &split.tags {
                    metadata::apply_filename_tags(&mut meta, tags);
                }
                archive.metadata = ParsedMetadata::Basic(meta);
                archive.listing = parsed.listing.clone();
                archive.preview = preview::resolve(path, parsed.embedded_preview.as_deref());
            }
            Err(err) => {
                archive.parse_error = Some(err.reason.clone());
                archive.preview = preview::resolve(path, None);
            }
        }
        archive
    }
}
