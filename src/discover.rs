//! Addons directory discovery
//!
//! Looks for a Left 4 Dead 2 install in the usual Steam locations and in
//! every library listed in Steam's `libraryfolders.vdf`.

use crate::vpk::keyvalues::{self, KvValue};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Addons directory relative to a Steam library
pub const ADDONS_SUBPATH: &str = "steamapps/common/Left 4 Dead 2/left4dead2/addons";

/// Library list relative to a Steam root
const LIBRARY_FOLDERS_VDF: &str = "steamapps/libraryfolders.vdf";

/// Steam installs relative to a drive root
#[cfg(windows)]
const DRIVE_STEAM_DIRS: [&str; 5] = [
    "Steam",
    "SteamLibrary",
    "Program Files (x86)/Steam",
    "Program Files/Steam",
    "Games/Steam",
];

/// Candidate Steam roots on this machine, existing ones only
pub fn steam_roots() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(home) = dirs::home_dir() {
        candidates.extend([
            home.join(".local/share/Steam"),
            home.join(".steam/debian-installation"),
            home.join(".steam/steam"),
            home.join(".var/app/com.valvesoftware.Steam/data/Steam"),
            home.join(".var/app/com.valvesoftware.Steam/.local/share/Steam"),
            home.join("snap/steam/common/.local/share/Steam"),
            home.join("Library/Application Support/Steam"),
        ]);
    }

    #[cfg(windows)]
    for drive in b'A'..=b'Z' {
        let root = PathBuf::from(format!("{}:\\", drive as char));
        if root.exists() {
            candidates.extend(DRIVE_STEAM_DIRS.iter().map(|dir| root.join(dir)));
        }
    }

    candidates.retain(|p| p.join("steamapps").is_dir());
    dedup_paths(&mut candidates);
    candidates
}

/// Library paths listed in `libraryfolders.vdf`, old and new formats
pub fn parse_library_folders(text: &str) -> Vec<PathBuf> {
    let nodes = keyvalues::parse(text);
    let Some(root) = keyvalues::find(&nodes, "libraryfolders") else {
        return Vec::new();
    };

    root.children()
        .iter()
        .filter_map(|child| match &child.value {
            // "1" "D:\\SteamLibrary"
            KvValue::Text(path) if child.key.chars().all(|c| c.is_ascii_digit()) => {
                Some(PathBuf::from(path))
            }
            // "0" { "path" "D:\\SteamLibrary" ... }
            KvValue::Block(_) => child.get_str("path").map(PathBuf::from),
            KvValue::Text(_) => None,
        })
        .collect()
}

/// Every library known to a Steam root, the root itself first
pub fn library_folders(steam_root: &Path) -> Vec<PathBuf> {
    let mut libraries = vec![steam_root.to_path_buf()];
    let vdf = steam_root.join(LIBRARY_FOLDERS_VDF);
    match std::fs::read(&vdf) {
        Ok(bytes) => libraries.extend(parse_library_folders(&keyvalues::decode_text(&bytes))),
        Err(e) => debug!("No library list at {}: {}", vdf.display(), e),
    }
    dedup_paths(&mut libraries);
    libraries
}

/// First library that contains an addons directory
pub fn find_addons_in(libraries: &[PathBuf]) -> Option<PathBuf> {
    libraries
        .iter()
        .map(|library| library.join(ADDONS_SUBPATH))
        .find(|addons| addons.is_dir())
}

/// Search the usual Steam locations for the addons directory
pub fn auto_discover_addons() -> Option<PathBuf> {
    for steam_root in steam_roots() {
        let libraries = library_folders(&steam_root);
        if let Some(addons) = find_addons_in(&libraries) {
            info!("Found addons directory: {}", addons.display());
            return Some(addons);
        }
    }
    debug!("No addons directory found");
    None
}

fn dedup_paths(paths: &mut Vec<PathBuf>) {
    let mut seen = std::collections::HashSet::new();
    paths.retain(|p| seen.insert(p.canonicalize().unwrap_or_else(|_| p.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_library_folders_new_format() {
        let vdf = r#"
"libraryfolders"
{
	"0"
	{
		"path"		"C:\\Program Files (x86)\\Steam"
		"apps" { "550" "123" }
	}
	"1"
	{
		"path"		"D:\\SteamLibrary"
	}
}"#;
        assert_eq!(
            parse_library_folders(vdf),
            vec![
                PathBuf::from("C:\\Program Files (x86)\\Steam"),
                PathBuf::from("D:\\SteamLibrary")
            ]
        );
    }

    #[test]
    fn test_parse_library_folders_old_format() {
        let vdf = r#""LibraryFolders" { "TimeNextStatsReport" "1" "ContentStatsID" "-1" "1" "/mnt/games/steam" }"#;
        assert_eq!(parse_library_folders(vdf), vec![PathBuf::from("/mnt/games/steam")]);
    }

    #[test]
    fn test_find_addons_across_libraries() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let steam = dir.path().join("Steam");
        let library = dir.path().join("Library");
        std::fs::create_dir_all(steam.join("steamapps"))?;
        std::fs::create_dir_all(library.join(ADDONS_SUBPATH))?;
        std::fs::write(
            steam.join(LIBRARY_FOLDERS_VDF),
            format!(
                "\"libraryfolders\" {{ \"0\" {{ \"path\" \"{}\" }} \"1\" {{ \"path\" \"{}\" }} }}",
                steam.display(),
                library.display()
            ),
        )?;

        let libraries = library_folders(&steam);
        assert_eq!(libraries, vec![steam.clone(), library.clone()]);
        assert_eq!(find_addons_in(&libraries), Some(library.join(ADDONS_SUBPATH)));
        Ok(())
    }
}
