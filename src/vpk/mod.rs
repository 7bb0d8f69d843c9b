//! VPK archive parsing
//!
//! Turns one `.vpk` file into its internal path listing plus classified
//! metadata. Only the directory tree and small descriptor files are read.

pub mod keyvalues;
pub mod metadata;
pub mod preview;
pub mod reader;

#[cfg(test)]
pub(crate) mod testing;

use crate::paths;
use metadata::BasicMetadata;
use reader::{VpkArchive, VpkError};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default cap on descriptor payload reads
pub const DEFAULT_MAX_PAYLOAD: u64 = 4 * 1024 * 1024;

/// Descriptor file at the archive root
const ADDON_INFO: &str = "addoninfo.txt";

/// Failure to parse a single archive
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize)]
#[error("{}: {reason}", file.display())]
pub struct ParseError {
    pub file: PathBuf,
    pub reason: String,
}

impl ParseError {
    pub fn new(file: &Path, reason: impl ToString) -> Self {
        Self {
            file: file.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Everything the catalog keeps from a successful parse
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArchive {
    pub metadata: BasicMetadata,
    /// Internal paths as stored in the tree
    pub listing: Vec<String>,
    /// Internal path of the preferred embedded preview image
    pub embedded_preview: Option<String>,
}

/// Parses archives for the catalog; a trait so scans can be observed in tests
pub trait ArchiveParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedArchive, ParseError>;
}

/// The real on-disk VPK parser
#[derive(Debug, Clone)]
pub struct VpkParser {
    max_payload: u64,
}

impl Default for VpkParser {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl VpkParser {
    pub fn with_max_payload(max_payload: u64) -> Self {
        Self { max_payload }
    }
}

impl ArchiveParser for VpkParser {
    fn parse(&self, path: &Path) -> Result<ParsedArchive, ParseError> {
        parse_with_limit(path, self.max_payload)
    }
}

/// Parse a VPK with the default payload cap
pub fn parse(path: &Path) -> Result<ParsedArchive, ParseError> {
    parse_with_limit(path, DEFAULT_MAX_PAYLOAD)
}

fn parse_with_limit(path: &Path, limit: u64) -> Result<ParsedArchive, ParseError> {
    let mut archive = VpkArchive::open(path).map_err(|e| ParseError::new(path, e))?;

    let listing: Vec<String> = archive.entries().iter().map(|e| e.path.clone()).collect();
    let normalized: Vec<String> = listing.iter().map(|p| paths::normalize_for_lookup(p)).collect();

    let addon = match read_text(&mut archive, path, ADDON_INFO, limit)? {
        Some(text) => keyvalues::parse_addon_info(&text),
        None => keyvalues::AddonInfo::default(),
    };

    let mission_entries: Vec<String> = listing
        .iter()
        .zip(&normalized)
        .filter(|(_, n)| n.starts_with("missions/") && n.ends_with(".txt"))
        .map(|(raw, _)| raw.clone())
        .collect();
    let mut missions = Vec::with_capacity(mission_entries.len());
    for entry in &mission_entries {
        if let Some(text) = read_text(&mut archive, path, entry, limit)? {
            missions.push(text);
        }
    }

    let metadata = metadata::classify(&normalized, &addon, &missions);
    let embedded_preview = preview::embedded_preview(&listing);

    debug!(
        "Parsed {} ({} entries, {})",
        path.display(),
        listing.len(),
        metadata.primary_tag
    );

    Ok(ParsedArchive {
        metadata,
        listing,
        embedded_preview,
    })
}

/// Read and decode a descriptor; oversized descriptors are skipped
fn read_text<R: std::io::Read + std::io::Seek>(
    archive: &mut VpkArchive<R>,
    path: &Path,
    entry: &str,
    limit: u64,
) -> Result<Option<String>, ParseError> {
    match archive.read_file(entry, limit) {
        Ok(Some(bytes)) => Ok(Some(keyvalues::decode_text(&bytes))),
        Ok(None) => Ok(None),
        Err(err @ VpkError::EntryTooLarge { .. }) => {
            warn!("Skipping descriptor in {}: {}", path.display(), err);
            Ok(None)
        }
        Err(err) => Err(ParseError::new(path, err)),
    }
}
