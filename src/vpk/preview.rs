//! Preview image discovery and loading
//!
//! Only a reference is stored in the catalog. The bytes are read when the
//! caller asks for them and returned as a `data:` URL.

use super::metadata::PreviewImage;
use super::reader::VpkArchive;
use crate::paths;
use anyhow::{bail, Context, Result};
use base64::Engine;
use std::path::Path;

/// Descriptor image shipped by most addons
pub const ADDON_IMAGE: &str = "addonimage.jpg";

/// Largest preview we are willing to load
pub const MAX_PREVIEW_BYTES: u64 = 8 * 1024 * 1024;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Pick the embedded preview from an archive listing
pub fn embedded_preview(listing: &[String]) -> Option<String> {
    listing
        .iter()
        .find(|p| paths::normalize_for_lookup(p) == ADDON_IMAGE)
        .or_else(|| {
            listing.iter().find(|p| {
                paths::extension(p).is_some_and(|ext| {
                    IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e))
                })
            })
        })
        .cloned()
}

/// Resolve the preview for an archive: embedded first, then a sidecar file
pub fn resolve(archive: &Path, embedded: Option<&str>) -> Option<PreviewImage> {
    if let Some(entry) = embedded {
        return Some(PreviewImage::Embedded {
            entry: entry.to_string(),
        });
    }
    paths::existing_sidecars(archive)
        .into_iter()
        .next()
        .map(|path| PreviewImage::Sidecar { path })
}

/// Image formats recognised by their leading bytes
fn mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else {
        None
    }
}

/// Encode image bytes as a `data:` URL, rejecting anything that is not JPEG/PNG
pub fn to_data_url(bytes: &[u8]) -> Result<String> {
    let Some(mime) = mime_type(bytes) else {
        bail!("Unsupported preview image format");
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{};base64,{}", mime, encoded))
}

/// Load a preview as a `data:` URL
pub fn load_data_url(archive: &Path, preview: &PreviewImage) -> Result<String> {
    let bytes = match preview {
        PreviewImage::Embedded { entry } => {
            let mut vpk = VpkArchive::open(archive)
                .with_context(|| format!("Failed to open {}", archive.display()))?;
            vpk.read_file(entry, MAX_PREVIEW_BYTES)
                .with_context(|| format!("Failed to read {} from {}", entry, archive.display()))?
                .with_context(|| format!("{} no longer contains {}", archive.display(), entry))?
        }
        PreviewImage::Sidecar { path } => {
            let size = std::fs::metadata(path)
                .with_context(|| format!("Failed to stat {}", path.display()))?
                .len();
            if size > MAX_PREVIEW_BYTES {
                bail!("Preview {} is too large ({} bytes)", path.display(), size);
            }
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?
        }
    };
    to_data_url(&bytes)
}
