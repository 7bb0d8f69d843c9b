//! Managed directory layout beneath an addons root

use crate::config::LayoutConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Which managed directory holds an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// Directly in the addons root; loaded by the game
    Root,
    /// Parked in the disabled directory
    Disabled,
    /// Staged in the workshop directory, never toggled directly
    Workshop,
}

impl Location {
    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Root => "root",
            Location::Disabled => "disabled",
            Location::Workshop => "workshop",
        }
    }

    /// Enabled state implied by the location
    pub fn is_enabled(&self) -> bool {
        matches!(self, Location::Root)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Location {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "root" | "addons" | "enabled" => Ok(Location::Root),
            "disabled" => Ok(Location::Disabled),
            "workshop" => Ok(Location::Workshop),
            other => Err(format!("unknown location '{}'", other)),
        }
    }
}

/// Resolved directories for one addons root
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
    pub disabled: PathBuf,
    pub workshop: PathBuf,
    pub temp: PathBuf,
    pub trash: PathBuf,
    pub hidden_prefix: String,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, config: &LayoutConfig) -> Self {
        let root = root.into();
        Self {
            disabled: root.join(&config.disabled_dir),
            workshop: root.join(&config.workshop_dir),
            temp: root.join(&config.temp_dir),
            trash: root.join(&config.trash_dir),
            hidden_prefix: config.hidden_prefix.clone(),
            root,
        }
    }

    /// Directory backing a location
    pub fn dir_for(&self, location: Location) -> &Path {
        match location {
            Location::Root => &self.root,
            Location::Disabled => &self.disabled,
            Location::Workshop => &self.workshop,
        }
    }

    /// Directories walked by a scan, paired with the location they imply
    pub fn scan_dirs(&self) -> [(Location, &Path); 3] {
        [
            (Location::Root, self.root.as_path()),
            (Location::Disabled, self.disabled.as_path()),
            (Location::Workshop, self.workshop.as_path()),
        ]
    }

    /// Derive the location of a file purely from its parent directory
    pub fn location_of(&self, path: &Path) -> Option<Location> {
        let parent = path.parent()?;
        self.scan_dirs()
            .into_iter()
            .find(|(_, dir)| *dir == parent)
            .map(|(location, _)| location)
    }

    /// Hidden iff the file name starts with the hidden prefix
    pub fn is_hidden(&self, file_name: &str) -> bool {
        file_name.starts_with(&self.hidden_prefix)
    }

    /// Name relative to the root with forward slashes (`workshop/123.vpk`)
    pub fn relative_name(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => crate::paths::display_name(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new("/games/addons", &LayoutConfig::default())
    }

    #[test]
    fn test_location_of() {
        let layout = layout();
        assert_eq!(
            layout.location_of(Path::new("/games/addons/a.vpk")),
            Some(Location::Root)
        );
        assert_eq!(
            layout.location_of(Path::new("/games/addons/disabled/a.vpk")),
            Some(Location::Disabled)
        );
        assert_eq!(
            layout.location_of(Path::new("/games/addons/workshop/a.vpk")),
            Some(Location::Workshop)
        );
        assert_eq!(layout.location_of(Path::new("/games/addons/temp/a.vpk")), None);
        assert_eq!(
            layout.location_of(Path::new("/games/addons/workshop/sub/a.vpk")),
            None
        );
    }

    #[test]
    fn test_enabled_follows_location() {
        assert!(Location::Root.is_enabled());
        assert!(!Location::Disabled.is_enabled());
        assert!(!Location::Workshop.is_enabled());
    }

    #[test]
    fn test_relative_name() {
        let layout = layout();
        assert_eq!(
            layout.relative_name(Path::new("/games/addons/workshop/123.vpk")),
            "workshop/123.vpk"
        );
        assert_eq!(layout.relative_name(Path::new("/games/addons/a.vpk")), "a.vpk");
        assert_eq!(layout.relative_name(Path::new("/elsewhere/b.vpk")), "b.vpk");
    }

    #[test]
    fn test_hidden() {
        let layout = layout();
        assert!(layout.is_hidden("_secret.vpk"));
        assert!(!layout.is_hidden("public.vpk"));
    }
}
