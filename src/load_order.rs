//! `addonlist.txt` load order
//!
//! The game keeps the addon load order in `addonlist.txt` next to the
//! addons directory. Two formats exist in the wild:
//! - a flat list, one file name per line
//! - Source KeyValues: `"AddonList" { "name.vpk" "1" ... }`
//!
//! Whatever format was read is written back, and every write replaces the
//! file atomically.

use crate::vpk::keyvalues::{self, KvValue};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the load order list
pub const ADDON_LIST_FILE: &str = "addonlist.txt";

/// Root block of the KeyValues format
const ADDON_LIST_KEY: &str = "AddonList";

/// Value given to entries added to a KeyValues list
const DEFAULT_ENTRY_VALUE: &str = "1";

#[derive(Debug, thiserror::Error)]
pub enum LoadOrderError {
    #[error("addonlist.txt not found: {0}")]
    Missing(PathBuf),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid archive name: '{0}'")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, LoadOrderError>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ListFormat {
    Flat,
    KeyValues { root_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    /// Per-entry value of the KeyValues format
    value: Option<String>,
}

/// Handle on one `addonlist.txt`
#[derive(Debug, Clone)]
pub struct LoadOrder {
    path: PathBuf,
}

impl LoadOrder {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Where the list lives for an addons root.
    ///
    /// The game directory (parent of `addons`) is preferred; a list inside
    /// the addons root itself is used when only that one exists.
    pub fn locate(root: &Path) -> PathBuf {
        let beside = root.join(ADDON_LIST_FILE);
        match root.parent().map(|p| p.join(ADDON_LIST_FILE)) {
            Some(parent) if parent.is_file() || !beside.is_file() => parent,
            _ => beside,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names in load order
    pub fn get_order(&self) -> Result<Vec<String>> {
        let (_, entries) = self.read()?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    /// 1-based position of `name`, or -1 if it is not listed
    pub fn position_of(&self, name: &str) -> Result<i64> {
        let (_, entries) = self.read()?;
        Ok(entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
            .map(|i| i as i64 + 1)
            .unwrap_or(-1))
    }

    /// Move (or insert) `name` to 1-based `index` and persist.
    ///
    /// `index` is clamped to `[1, len + 1]`; returns the final position.
    pub fn set_position(&self, name: &str, index: i64) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() || name.contains(['"', '\n', '\r']) {
            return Err(LoadOrderError::InvalidName(name.to_string()));
        }

        let (format, mut entries) = self.read()?;

        let existing = entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
            .map(|i| entries.remove(i));

        let len = entries.len() as i64;
        let index = index.clamp(1, len + 1);

        let entry = match (&format, existing) {
            (_, Some(entry)) => entry,
            (ListFormat::KeyValues { .. }, None) => Entry {
                name: name.to_string(),
                value: Some(DEFAULT_ENTRY_VALUE.to_string()),
            },
            (ListFormat::Flat, None) => Entry {
                name: name.to_string(),
                value: None,
            },
        };
        entries.insert((index - 1) as usize, entry);

        self.write(&format, &entries)?;
        info!("Load order: {} -> position {}", name, index);
        Ok(index)
    }

    fn read(&self) -> Result<(ListFormat, Vec<Entry>)> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadOrderError::Missing(self.path.clone()));
            }
            Err(source) => {
                return Err(LoadOrderError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let text = keyvalues::decode_text(&bytes);
        let (format, entries) = parse_list(&text);
        debug!("Read {} load order entries from {}", entries.len(), self.path.display());
        Ok((format, entries))
    }

    fn write(&self, format: &ListFormat, entries: &[Entry]) -> Result<()> {
        let io_err = |source: std::io::Error| LoadOrderError::Io {
            path: self.path.clone(),
            source,
        };

        let text = render_list(format, entries);
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(text.as_bytes()).map_err(io_err)?;
        tmp.flush().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

fn parse_list(text: &str) -> (ListFormat, Vec<Entry>) {
    let mut entries: Vec<Entry> = Vec::new();
    let mut push = |entry: Entry| {
        if !entries.iter().any(|e| e.name.eq_ignore_ascii_case(&entry.name)) {
            entries.push(entry);
        }
    };

    if text.contains('{') {
        let nodes = keyvalues::parse(text);
        if let Some(list) = keyvalues::find(&nodes, ADDON_LIST_KEY) {
            for child in list.children() {
                let value = match &child.value {
                    KvValue::Text(v) => Some(v.clone()),
                    KvValue::Block(_) => continue,
                };
                push(Entry {
                    name: child.key.clone(),
                    value,
                });
            }
            return (
                ListFormat::KeyValues {
                    root_key: list.key.clone(),
                },
                entries,
            );
        }
    }

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let name = line.trim_matches('"').trim();
        if !name.is_empty() {
            push(Entry {
                name: name.to_string(),
                value: None,
            });
        }
    }
    (ListFormat::Flat, entries)
}

fn render_list(format: &ListFormat, entries: &[Entry]) -> String {
    match format {
        ListFormat::Flat => {
            let mut out = String::new();
            for entry in entries {
                out.push_str(&entry.name);
                out.push('\n');
            }
            out
        }
        ListFormat::KeyValues { root_key } => {
            let mut out = format!("\"{}\"\n{{\n", root_key);
            for entry in entries {
                let value = entry.value.as_deref().unwrap_or(DEFAULT_ENTRY_VALUE);
                out.push_str(&format!("\t\"{}\"\t\t\"{}\"\n", escape(&entry.name), escape(value)));
            }
            out.push_str("}\n");
            out
        }
    }
}

/// Inverse of the tokenizer's unescaping: `\` first, then `"`
fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KV_LIST: &str = r#"
// generated by the game
"AddonList"
{
	"rifle.vpk"		"1"
	"map.vpk"		"0"
	"workshop\123.vpk"		"1"
}
"#;

    #[test]
    fn test_missing_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let order = LoadOrder::open(dir.path().join(ADDON_LIST_FILE));
        let err = order.get_order().unwrap_err();
        assert!(matches!(err, LoadOrderError::Missing(_)));
        assert!(err.to_string().starts_with("addonlist.txt not found"));
        Ok(())
    }

    #[test]
    fn test_flat_list() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(ADDON_LIST_FILE);
        std::fs::write(&path, "// order\nb.vpk\n\n\"a.vpk\"\nB.VPK\n")?;

        let order = LoadOrder::open(&path);
        assert_eq!(order.get_order()?, vec!["b.vpk", "a.vpk"]);
        assert_eq!(order.position_of("A.vpk")?, 2);
        assert_eq!(order.position_of("zzz.vpk")?, -1);
        Ok(())
    }

    #[test]
    fn test_keyvalues_list() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(ADDON_LIST_FILE);
        std::fs::write(&path, KV_LIST)?;

        let order = LoadOrder::open(&path);
        assert_eq!(
            order.get_order()?,
            vec!["rifle.vpk", "map.vpk", "workshop\\123.vpk"]
        );
        Ok(())
    }

    #[test]
    fn test_set_position_persists() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(ADDON_LIST_FILE);
        std::fs::write(&path, "a.vpk\nb.vpk\nc.vpk\n")?;

        let order = LoadOrder::open(&path);
        assert_eq!(order.set_position("C.vpk", 1)?, 1);
        assert_eq!(order.set_position("new.vpk", 99)?, 4);
        assert_eq!(order.set_position("a.vpk", -5)?, 1);

        let fresh = LoadOrder::open(&path);
        assert_eq!(fresh.get_order()?, vec!["a.vpk", "c.vpk", "b.vpk", "new.vpk"]);
        assert_eq!(fresh.position_of("b.vpk")?, 3);
        Ok(())
    }

    #[test]
    fn test_keyvalues_format_preserved() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(ADDON_LIST_FILE);
        std::fs::write(&path, "\"AddonList\" { \"a.vpk\" \"0\" \"b.vpk\" \"1\" }")?;

        let order = LoadOrder::open(&path);
        order.set_position("a.vpk", 2)?;
        order.set_position("c.vpk", 1)?;

        let text = std::fs::read_to_string(&path)?;
        assert!(text.starts_with("\"AddonList\""));
        let nodes = keyvalues::parse(&text);
        let list = keyvalues::find(&nodes, "addonlist").unwrap();
        let pairs: Vec<_> = list
            .children()
            .iter()
            .map(|n| (n.key.as_str(), n.as_str().unwrap_or_default()))
            .collect();
        assert_eq!(pairs, vec![("c.vpk", "1"), ("b.vpk", "1"), ("a.vpk", "0")]);
        Ok(())
    }

    #[test]
    fn test_keyvalues_backslash_round_trip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(ADDON_LIST_FILE);
        std::fs::write(&path, KV_LIST)?;

        let order = LoadOrder::open(&path);
        order.set_position("workshop\\456.vpk", 1)?;

        let text = std::fs::read_to_string(&path)?;
        assert!(text.contains(r#""workshop\\123.vpk""#));
        assert!(text.contains(r#""workshop\\456.vpk""#));

        let fresh = LoadOrder::open(&path);
        assert_eq!(
            fresh.get_order()?,
            vec!["workshop\\456.vpk", "rifle.vpk", "map.vpk", "workshop\\123.vpk"]
        );
        Ok(())
    }

    #[test]
    fn test_invalid_name() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(ADDON_LIST_FILE);
        std::fs::write(&path, "a.vpk\n")?;
        assert!(matches!(
            LoadOrder::open(&path).set_position("  ", 1),
            Err(LoadOrderError::InvalidName(_))
        ));
        Ok(())
    }

    #[test]
    fn test_locate_prefers_game_dir() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("addons");
        std::fs::create_dir_all(&root)?;
        assert_eq!(LoadOrder::locate(&root), dir.path().join(ADDON_LIST_FILE));

        std::fs::write(root.join(ADDON_LIST_FILE), "a.vpk\n")?;
        assert_eq!(LoadOrder::locate(&root), root.join(ADDON_LIST_FILE));

        std::fs::write(dir.path().join(ADDON_LIST_FILE), "a.vpk\n")?;
        assert_eq!(LoadOrder::locate(&root), dir.path().join(ADDON_LIST_FILE));
        Ok(())
    }
}
