//! Minimal VPK writer for building fixtures in tests

use std::collections::BTreeMap;
use std::path::Path;

/// Builds single-file VPKs with every payload stored after the tree
pub(crate) struct VpkBuilder {
    version: u32,
    files: Vec<(String, Vec<u8>)>,
}

impl VpkBuilder {
    pub fn new() -> Self {
        Self {
            version: 1,
            files: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.push((path.to_string(), data.to_vec()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        // ext -> dir -> [(name, data)]
        let mut tree: BTreeMap<String, BTreeMap<String, Vec<(String, &[u8])>>> = BTreeMap::new();
        for (path, data) in &self.files {
            let (dir, file) = match path.rfind('/') {
                Some(idx) => (&path[..idx], &path[idx + 1..]),
                None => (" ", path.as_str()),
            };
            let (name, ext) = match file.rfind('.') {
                Some(idx) => (&file[..idx], &file[idx + 1..]),
                None => (file, " "),
            };
            tree.entry(ext.to_string())
                .or_default()
                .entry(dir.to_string())
                .or_default()
                .push((name.to_string(), data.as_slice()));
        }

        let mut tree_bytes = Vec::new();
        let mut data_bytes = Vec::new();
        for (ext, dirs) in &tree {
            push_cstr(&mut tree_bytes, ext);
            for (dir, files) in dirs {
                push_cstr(&mut tree_bytes, dir);
                for (name, data) in files {
                    push_cstr(&mut tree_bytes, name);
                    tree_bytes.extend_from_slice(&0u32.to_le_bytes()); // crc
                    tree_bytes.extend_from_slice(&0u16.to_le_bytes()); // preload
                    tree_bytes.extend_from_slice(&0x7FFFu16.to_le_bytes());
                    tree_bytes.extend_from_slice(&(data_bytes.len() as u32).to_le_bytes());
                    tree_bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    tree_bytes.extend_from_slice(&0xFFFFu16.to_le_bytes());
                    data_bytes.extend_from_slice(data);
                }
                tree_bytes.push(0);
            }
            tree_bytes.push(0);
        }
        tree_bytes.push(0);

        let mut out = Vec::new();
        out.extend_from_slice(&0x55AA_1234u32.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(tree_bytes.len() as u32).to_le_bytes());
        if self.version == 2 {
            out.extend_from_slice(&(data_bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&[0u8; 12]);
        }
        out.extend_from_slice(&tree_bytes);
        out.extend_from_slice(&data_bytes);
        out
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.build())
    }
}

fn push_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}
