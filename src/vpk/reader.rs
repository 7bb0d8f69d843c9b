//! VPK directory file reader
//!
//! A VPK "directory" file starts with a small header followed by a tree of
//! NUL-terminated strings grouped extension -> directory -> file name, each
//! file carrying a fixed-size entry record plus optional preload bytes.
//! Addon VPKs usually keep their payloads inline after the tree
//! (archive index 0x7FFF); multi-chunk archives keep them in `name_NNN.vpk`.
//!
//! Only the tree is parsed up front. Payloads are read on demand with an
//! explicit size cap.

use crate::paths;
use binrw::prelude::*;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Archive index marking data stored in the directory file itself
pub const DIR_ARCHIVE_INDEX: u16 = 0x7FFF;

/// Terminator closing every directory entry
const ENTRY_TERMINATOR: u16 = 0xFFFF;

const HEADER_V1_SIZE: u64 = 12;
const HEADER_V2_SIZE: u64 = 28;

/// VPK header, signature 0x55AA1234 stored little-endian
#[derive(Debug, BinRead)]
#[br(little, magic = 0x55AA_1234u32)]
struct RawHeader {
    version: u32,

    /// Size of the directory tree in bytes
    tree_size: u32,

    #[br(if(version == 2))]
    v2: Option<HeaderV2>,
}

/// Extra section sizes present in version 2 headers
#[derive(Debug, BinRead)]
#[br(little)]
#[allow(dead_code)]
struct HeaderV2 {
    file_data_section_size: u32,
    archive_md5_section_size: u32,
    other_md5_section_size: u32,
    signature_section_size: u32,
}

/// Fixed part of a tree entry
#[derive(Debug, BinRead)]
#[br(little)]
struct RawEntry {
    crc32: u32,
    preload_bytes: u16,
    archive_index: u16,
    entry_offset: u32,
    entry_length: u32,
    terminator: u16,
}

/// Errors raised while reading a VPK
#[derive(Debug, thiserror::Error)]
pub enum VpkError {
    #[error("not a VPK file (bad signature)")]
    IllegalMagic,

    #[error("unsupported VPK version {0}")]
    UnsupportedVersion(u32),

    #[error("directory tree of {tree_size} bytes does not fit in a {file_size} byte file")]
    TreeOverrun { tree_size: u32, file_size: u64 },

    #[error("illegal entry terminator 0x{terminator:04x} at tree offset {offset}")]
    IllegalTerminator { terminator: u16, offset: u64 },

    #[error("unexpected end of directory tree")]
    UnexpectedEof,

    #[error("entry '{path}' is {size} bytes, over the {limit} byte read limit")]
    EntryTooLarge { path: String, size: u64, limit: u64 },

    #[error("entry '{0}' points outside its archive")]
    EntryOutOfBounds(String),

    #[error("archive chunk {index} holding '{path}' is unavailable")]
    MissingChunk { path: String, index: u16 },

    #[error("malformed header: {0}")]
    Header(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn map_binrw(err: binrw::Error) -> VpkError {
    match err {
        binrw::Error::BadMagic { .. } => VpkError::IllegalMagic,
        binrw::Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            VpkError::UnexpectedEof
        }
        binrw::Error::Io(e) => VpkError::Io(e),
        other => VpkError::Header(other.to_string()),
    }
}

/// One file declared in the directory tree
#[derive(Debug, Clone)]
pub struct VpkEntry {
    /// Internal path, `dir/name.ext`
    pub path: String,
    pub crc32: u32,
    pub preload: Vec<u8>,
    pub archive_index: u16,
    pub offset: u32,
    pub length: u32,
}

impl VpkEntry {
    /// Total payload size (preload + archived bytes)
    pub fn size(&self) -> u64 {
        self.preload.len() as u64 + self.length as u64
    }
}

/// Parsed directory of a VPK archive
pub struct VpkArchive<R> {
    reader: R,
    source: Option<PathBuf>,
    version: u32,
    data_offset: u64,
    file_size: u64,
    entries: Vec<VpkEntry>,
}

impl VpkArchive<BufReader<File>> {
    /// Open a VPK directory file from disk
    pub fn open(path: &Path) -> Result<Self, VpkError> {
        let file = File::open(path)?;
        VpkArchive::from_reader(BufReader::new(file), Some(path.to_path_buf()))
    }
}

impl<R: Read + Seek> VpkArchive<R> {
    /// Parse the header and tree from any seekable reader.
    ///
    /// `source` is the on-disk location, needed to find sibling chunk files.
    pub fn from_reader(mut reader: R, source: Option<PathBuf>) -> Result<Self, VpkError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let header = RawHeader::read(&mut reader).map_err(map_binrw)?;
        let header_size = match (header.version, &header.v2) {
            (1, _) => HEADER_V1_SIZE,
            (2, Some(_)) => HEADER_V2_SIZE,
            (version, _) => return Err(VpkError::UnsupportedVersion(version)),
        };

        if header_size + header.tree_size as u64 > file_size {
            return Err(VpkError::TreeOverrun {
                tree_size: header.tree_size,
                file_size,
            });
        }

        let mut tree = vec![0u8; header.tree_size as usize];
        reader.read_exact(&mut tree)?;
        let entries = parse_tree(&tree)?;

        Ok(Self {
            reader,
            source,
            version: header.version,
            data_offset: header_size + header.tree_size as u64,
            file_size,
            entries,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn entries(&self) -> &[VpkEntry] {
        &self.entries
    }

    /// Find an entry by internal path, ignoring case and separator style
    pub fn find(&self, path: &str) -> Option<&VpkEntry> {
        let target = paths::normalize_for_lookup(path);
        self.entries
            .iter()
            .find(|e| paths::normalize_for_lookup(&e.path) == target)
    }

    /// Read a file's bytes, refusing anything larger than `limit`
    pub fn read_file(&mut self, path: &str, limit: u64) -> Result<Option<Vec<u8>>, VpkError> {
        let entry = match self.find(path) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        self.read_entry(&entry, limit).map(Some)
    }

    /// Read an entry's bytes, refusing anything larger than `limit`
    pub fn read_entry(&mut self, entry: &VpkEntry, limit: u64) -> Result<Vec<u8>, VpkError> {
        if entry.size() > limit {
            return Err(VpkError::EntryTooLarge {
                path: entry.path.clone(),
                size: entry.size(),
                limit,
            });
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        data.extend_from_slice(&entry.preload);
        if entry.length == 0 {
            return Ok(data);
        }

        let mut chunk = vec![0u8; entry.length as usize];
        if entry.archive_index == DIR_ARCHIVE_INDEX {
            let start = self.data_offset + entry.offset as u64;
            if start + entry.length as u64 > self.file_size {
                return Err(VpkError::EntryOutOfBounds(entry.path.clone()));
            }
            self.reader.seek(SeekFrom::Start(start))?;
            self.reader.read_exact(&mut chunk)?;
        } else {
            let chunk_path = self
                .chunk_path(entry.archive_index)
                .filter(|p| p.is_file())
                .ok_or_else(|| VpkError::MissingChunk {
                    path: entry.path.clone(),
                    index: entry.archive_index,
                })?;
            let mut file = File::open(&chunk_path)?;
            let chunk_size = file.metadata()?.len();
            if entry.offset as u64 + entry.length as u64 > chunk_size {
                return Err(VpkError::EntryOutOfBounds(entry.path.clone()));
            }
            file.seek(SeekFrom::Start(entry.offset as u64))?;
            file.read_exact(&mut chunk)?;
        }

        data.extend_from_slice(&chunk);
        Ok(data)
    }

    /// `pak01_dir.vpk` -> `pak01_003.vpk` for archive index 3
    fn chunk_path(&self, index: u16) -> Option<PathBuf> {
        let source = self.source.as_ref()?;
        let stem = source.file_stem()?.to_str()?;
        let prefix = stem.strip_suffix("_dir")?;
        Some(source.with_file_name(format!("{}_{:03}.vpk", prefix, index)))
    }
}

/// Check the signature and version without parsing the tree
pub fn probe(path: &Path) -> Result<u32, VpkError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = RawHeader::read(&mut reader).map_err(map_binrw)?;
    match header.version {
        1 | 2 => Ok(header.version),
        other => Err(VpkError::UnsupportedVersion(other)),
    }
}

fn parse_tree(tree: &[u8]) -> Result<Vec<VpkEntry>, VpkError> {
    let mut cursor = Cursor::new(tree);
    let mut entries = Vec::new();

    loop {
        let ext = read_cstr(&mut cursor)?;
        if ext.is_empty() {
            break;
        }
        loop {
            let dir = read_cstr(&mut cursor)?;
            if dir.is_empty() {
                break;
            }
            loop {
                let name = read_cstr(&mut cursor)?;
                if name.is_empty() {
                    break;
                }

                let offset = cursor.position();
                let raw = RawEntry::read(&mut cursor).map_err(map_binrw)?;
                if raw.terminator != ENTRY_TERMINATOR {
                    return Err(VpkError::IllegalTerminator {
                        terminator: raw.terminator,
                        offset,
                    });
                }

                let start = cursor.position() as usize;
                let end = start + raw.preload_bytes as usize;
                if end > tree.len() {
                    return Err(VpkError::UnexpectedEof);
                }
                cursor.set_position(end as u64);

                entries.push(VpkEntry {
                    path: paths::join_entry_path(&dir, &name, &ext),
                    crc32: raw.crc32,
                    preload: tree[start..end].to_vec(),
                    archive_index: raw.archive_index,
                    offset: raw.entry_offset,
                    length: raw.entry_length,
                });
            }
        }
    }

    Ok(entries)
}

fn read_cstr(cursor: &mut Cursor<&[u8]>) -> Result<String, VpkError> {
    let buf: &[u8] = cursor.get_ref();
    let start = cursor.position() as usize;
    let rest = buf.get(start..).ok_or(VpkError::UnexpectedEof)?;
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(VpkError::UnexpectedEof)?;
    cursor.set_position((start + len + 1) as u64);
    Ok(String::from_utf8_lossy(&rest[..len]).into_owned())
}
