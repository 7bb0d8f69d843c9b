//! Installing dropped files into the addons root
//!
//! Accepts bare `.vpk` files and `.zip`/`.7z`/`.rar` archives. Only the VPKs
//! inside archives are extracted, flattened into the destination directory.

use crate::mutator::BatchResult;
use crate::paths;
use crate::vpk::reader;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Install every path into `dest`, continuing past failures
pub fn ingest(paths: &[PathBuf], dest: &Path) -> BatchResult {
    let mut result = BatchResult::default();
    for path in paths {
        let outcome = ingest_one(path, dest);
        if let Ok(installed) = &outcome {
            info!("Installed {} archive(s) from {}", installed.len(), path.display());
        }
        result.record(path, outcome.map_err(|e| format!("{:#}", e)));
    }
    result
}

/// Install one dropped file, returning the archives written
pub fn ingest_one(path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    if paths::is_vpk(path) {
        return install_vpk(path, dest).map(|p| vec![p]);
    }
    extract_vpks(path, dest)
}

/// Extract all VPKs from a zip/7z/rar archive into `dest`
pub fn extract_vpks(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let extension = archive
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let installed = match extension.as_str() {
        "zip" => extract_from_zip(archive, dest)?,
        "7z" => extract_from_7z(archive, dest)?,
        "rar" => extract_from_rar(archive, dest)?,
        _ => bail!("Unsupported file type: {}", archive.display()),
    };

    if installed.is_empty() {
        bail!("No VPK files found in {}", archive.display());
    }
    Ok(installed)
}

/// Copy a VPK into `dest` after checking its header
fn install_vpk(src: &Path, dest: &Path) -> Result<PathBuf> {
    reader::probe(src).with_context(|| format!("Not a valid VPK: {}", src.display()))?;

    let target = dest.join(paths::display_name(src));
    if let (Ok(a), Ok(b)) = (src.canonicalize(), target.canonicalize()) {
        if a == b {
            debug!("{} is already installed", src.display());
            return Ok(target);
        }
    }
    if target.exists() {
        std::fs::remove_file(&target)
            .with_context(|| format!("Failed to replace {}", target.display()))?;
    }

    reflink_copy::reflink_or_copy(src, &target)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), target.display()))?;
    Ok(target)
}

/// Decode a raw zip entry name: UTF-8, else GB18030
pub fn decode_entry_name(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(name) => name.to_string(),
        Err(_) => {
            let (name, _) = encoding_rs::GB18030.decode_without_bom_handling(raw);
            name.into_owned()
        }
    }
}

/// Write `reader` to `dest/name` via a temp file in the same directory
fn write_flat(reader: &mut impl std::io::Read, dest: &Path, name: &str) -> Result<PathBuf> {
    let target = dest.join(name);
    let mut tmp = tempfile::NamedTempFile::new_in(dest)
        .with_context(|| format!("Failed to create temp file in {}", dest.display()))?;
    std::io::copy(reader, &mut tmp).with_context(|| format!("Failed to extract {}", name))?;
    tmp.flush()?;
    tmp.persist(&target)
        .with_context(|| format!("Failed to write {}", target.display()))?;
    Ok(target)
}

fn extract_from_zip(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open ZIP: {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("Failed to read ZIP: {}", archive_path.display()))?;

    let mut installed = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let entry_name = decode_entry_name(entry.name_raw());
        let name = paths::file_name(&entry_name).to_string();
        if name.is_empty() || !paths::is_vpk(Path::new(&name)) {
            continue;
        }

        debug!("Extracting {} from {}", entry_name, archive_path.display());
        installed.push(write_flat(&mut entry, dest, &name)?);
    }
    Ok(installed)
}

fn extract_from_7z(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    // Decompress next to the destination so the final move is a rename
    let temp_dir = tempfile::tempdir_in(dest).context("Failed to create temp directory")?;
    sevenz_rust2::decompress_file(archive_path, temp_dir.path())
        .with_context(|| format!("Failed to decompress 7z archive: {}", archive_path.display()))?;

    let mut installed = Vec::new();
    for entry in walkdir::WalkDir::new(temp_dir.path())
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() || !paths::is_vpk(entry.path()) {
            continue;
        }
        let target = dest.join(entry.file_name());
        std::fs::rename(entry.path(), &target)
            .with_context(|| format!("Failed to move {} into place", target.display()))?;
        installed.push(target);
    }
    Ok(installed)
}

fn extract_from_rar(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let archive = unrar::Archive::new(archive_path)
        .open_for_processing()
        .with_context(|| format!("Failed to open RAR: {}", archive_path.display()))?;
    let temp_dir = tempfile::tempdir_in(dest).context("Failed to create temp directory")?;

    let mut installed = Vec::new();
    let mut cursor = Some(archive);

    while let Some(archive) = cursor.take() {
        match archive.read_header() {
            Ok(Some(entry)) => {
                let header = entry.entry();
                let entry_name = header.filename.to_string_lossy().to_string();
                let name = paths::file_name(&entry_name).to_string();

                if header.is_file() && !name.is_empty() && paths::is_vpk(Path::new(&name)) {
                    let temp_path = temp_dir.path().join(format!("{}.part", installed.len()));
                    cursor = Some(
                        entry
                            .extract_to(&temp_path)
                            .with_context(|| format!("Failed to extract RAR entry: {}", entry_name))?,
                    );
                    let target = dest.join(&name);
                    std::fs::rename(&temp_path, &target)
                        .with_context(|| format!("Failed to move {} into place", target.display()))?;
                    installed.push(target);
                } else {
                    cursor = Some(entry.skip().context("Failed to skip RAR entry")?);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Stopped reading {}: {}", archive_path.display(), e);
                return Err(e).context("Failed to read RAR header");
            }
        }
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpk::testing::VpkBuilder;
    use tempfile::tempdir;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) -> anyhow::Result<()> {
        let file = File::create(path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in files {
            zip.start_file(*name, options)?;
            zip.write_all(data)?;
        }
        zip.finish()?;
        Ok(())
    }

    #[test]
    fn test_install_vpk() -> anyhow::Result<()> {
        let src_dir = tempdir()?;
        let dest = tempdir()?;
        let src = src_dir.path().join("skin.vpk");
        VpkBuilder::new().file("a.txt", b"x").write(&src)?;

        let installed = ingest_one(&src, dest.path())?;
        assert_eq!(installed, vec![dest.path().join("skin.vpk")]);
        assert!(src.exists());

        // Reinstalling replaces the copy
        let again = ingest_one(&src, dest.path())?;
        assert_eq!(again, installed);
        Ok(())
    }

    #[test]
    fn test_invalid_vpk_rejected() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("fake.vpk");
        std::fs::write(&src, b"PK not really")?;
        assert!(ingest_one(&src, &dir.path().join("out")).is_err());
        Ok(())
    }

    #[test]
    fn test_zip_flattens_vpks_only() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let dest = dir.path().join("addons");
        let zip_path = dir.path().join("pack.zip");
        write_zip(
            &zip_path,
            &[
                ("readme.txt", b"hi"),
                ("nested/deep/one.vpk", b"one"),
                ("two.VPK", b"two"),
            ],
        )?;

        let mut installed = ingest_one(&zip_path, &dest)?;
        installed.sort();
        assert_eq!(installed, vec![dest.join("one.vpk"), dest.join("two.VPK")]);
        assert_eq!(std::fs::read(dest.join("one.vpk"))?, b"one");
        assert!(!dest.join("readme.txt").exists());
        Ok(())
    }

    #[test]
    fn test_zip_without_vpk_is_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let zip_path = dir.path().join("empty.zip");
        write_zip(&zip_path, &[("readme.txt", b"hi")])?;
        let err = ingest_one(&zip_path, &dir.path().join("out")).unwrap_err();
        assert!(err.to_string().contains("No VPK files"));
        Ok(())
    }

    #[test]
    fn test_batch_counts() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let dest = dir.path().join("addons");
        let good = dir.path().join("good.vpk");
        VpkBuilder::new().file("a.txt", b"x").write(&good)?;
        let unsupported = dir.path().join("notes.txt");
        std::fs::write(&unsupported, b"x")?;

        let result = ingest(&[good, unsupported], &dest);
        assert_eq!(result.success, 1);
        assert_eq!(result.failed, 1);
        assert!(result.errors[0].contains("Unsupported file type"));
        Ok(())
    }

    #[test]
    fn test_decode_entry_name() {
        assert_eq!(decode_entry_name("地图.vpk".as_bytes()), "地图.vpk");
        // "中文" in GB18030
        assert_eq!(decode_entry_name(&[0xD6, 0xD0, 0xCE, 0xC4]), "中文");
    }
}
