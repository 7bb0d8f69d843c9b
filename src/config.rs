//! Session configuration
//!
//! Persisted as JSON under the user's config directory. Every section
//! falls back to defaults field-by-field, so older files keep loading.

use crate::conflict::ConflictPolicy;
use crate::rotation::RotationConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Directory (under the platform config dir) holding `config.json`
const CONFIG_DIR_NAME: &str = "vpkhub";

/// File name of the persisted configuration
const CONFIG_FILE_NAME: &str = "config.json";

/// Built-in Steam UGC CDN edge addresses raced during IP acceleration
pub const DEFAULT_CDN_IPS: [&str; 9] = [
    "104.116.243.163",
    "104.116.243.72",
    "2.17.107.170",
    "2.17.107.243",
    "23.192.228.147",
    "23.192.228.139",
    "23.52.74.14",
    "23.212.62.72",
    "23.212.62.73",
];

/// Top-level configuration for an [`AppSession`](crate::session::AppSession)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Last managed addons directory
    pub root_dir: Option<PathBuf>,

    /// Names of the managed subdirectories and the hidden-file prefix
    pub layout: LayoutConfig,

    /// Which archives take part in conflict checks and how paths are graded
    pub conflicts: ConflictPolicy,

    /// Download pool, retry and IP acceleration settings
    pub downloads: DownloadConfig,

    /// Categories taking part in random mod rotation
    pub rotation: RotationConfig,
}

/// Managed directory names, relative to the addons root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub disabled_dir: String,
    pub workshop_dir: String,
    /// Partial downloads live here until they complete
    pub temp_dir: String,
    /// Deleted archives are moved here instead of being erased
    pub trash_dir: String,
    /// File name prefix that marks an archive as hidden
    pub hidden_prefix: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            disabled_dir: "disabled".to_string(),
            workshop_dir: "workshop".to_string(),
            temp_dir: "temp".to_string(),
            trash_dir: ".vpk_trash".to_string(),
            hidden_prefix: "_".to_string(),
        }
    }
}

/// Download orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum number of transfers running at once
    pub max_concurrent: usize,

    /// Default for tasks started without an explicit acceleration choice
    pub use_optimized_ip: bool,

    /// Hosts eligible for IP acceleration
    pub cdn_hosts: Vec<String>,

    /// Candidate edge addresses raced before a CDN transfer
    pub candidate_ips: Vec<String>,

    /// TCP port used for latency probes
    pub probe_port: u16,

    /// Per-candidate connect timeout
    pub probe_timeout_ms: u64,

    /// Upper bound on the whole latency race
    pub selection_timeout_ms: u64,

    /// Bytes fetched from each latency finalist for a throughput check.
    /// 0 (the default) keeps the lowest-latency winner.
    pub speed_test_bytes: u64,

    /// Upper bound on the speed test phase
    pub speed_test_timeout_ms: u64,

    /// Workshop details endpoint (expects a JSON array of ids)
    pub details_api_url: String,

    /// Attempts per request before a task fails
    pub max_retries: u32,

    /// Delay between attempts
    pub retry_delay_ms: u64,

    /// Honour HTTP(S)_PROXY from the environment
    pub use_system_proxy: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            use_optimized_ip: false,
            cdn_hosts: vec![
                "cdn.steamusercontent.com".to_string(),
                "steamusercontent-a.akamaihd.net".to_string(),
            ],
            candidate_ips: DEFAULT_CDN_IPS.iter().map(|s| s.to_string()).collect(),
            probe_port: 80,
            probe_timeout_ms: 1500,
            selection_timeout_ms: 2000,
            speed_test_bytes: 0,
            speed_test_timeout_ms: 5000,
            details_api_url: "https://steamworkshopdownloader.io/api/details/file".to_string(),
            max_retries: 3,
            retry_delay_ms: 2000,
            use_system_proxy: true,
        }
    }
}

impl DownloadConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn selection_timeout(&self) -> Duration {
        Duration::from_millis(self.selection_timeout_ms)
    }

    pub fn speed_test_timeout(&self) -> Duration {
        Duration::from_millis(self.speed_test_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Whether `host` is one of the configured CDN hosts
    pub fn is_cdn_host(&self, host: &str) -> bool {
        self.cdn_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }
}

impl SessionConfig {
    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load configuration, returning defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Write configuration atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .with_context(|| format!("Config path has no parent: {}", path.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let layout = &self.layout;
        if layout.hidden_prefix.is_empty() {
            return Err(ConfigError::EmptyHiddenPrefix);
        }

        let dirs = [
            &layout.disabled_dir,
            &layout.workshop_dir,
            &layout.temp_dir,
            &layout.trash_dir,
        ];
        for name in dirs {
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(ConfigError::InvalidSubdirectory(name.clone()));
            }
        }
        for (i, a) in dirs.iter().enumerate() {
            if dirs[i + 1..].iter().any(|b| a.eq_ignore_ascii_case(b)) {
                return Err(ConfigError::DuplicateSubdirectory(a.to_string()));
            }
        }

        if self.downloads.max_concurrent == 0 {
            return Err(ConfigError::NoDownloadSlots);
        }

        Ok(())
    }
}

/// Check that a directory exists, is a directory and can be written to
pub fn validate_directory(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::EmptyPath);
    }

    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::DirectoryNotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(ConfigError::Inaccessible {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    if !meta.is_dir() {
        return Err(ConfigError::NotADirectory(path.to_path_buf()));
    }

    // Probe file is removed when dropped
    tempfile::Builder::new()
        .prefix(".vpkhub-write-test")
        .tempfile_in(path)
        .map_err(|e| ConfigError::NotWritable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    Ok(())
}

/// Configuration errors
///
/// These describe "feature unavailable" states: the user has to pick a
/// different directory or fix a file rather than retry.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No addons directory selected")]
    RootNotSet,

    #[error("Path is empty")]
    EmptyPath,

    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Cannot access {path}: {reason}")]
    Inaccessible { path: PathBuf, reason: String },

    #[error("Directory is not writable: {path} ({reason})")]
    NotWritable { path: PathBuf, reason: String },

    #[error("Hidden prefix must not be empty")]
    EmptyHiddenPrefix,

    #[error("Invalid managed subdirectory name: '{0}'")]
    InvalidSubdirectory(String),

    #[error("Managed subdirectory used twice: '{0}'")]
    DuplicateSubdirectory(String),

    #[error("At least one concurrent download is required")]
    NoDownloadSlots,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_validate() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_layout() {
        let mut config = SessionConfig::default();
        config.layout.workshop_dir = "Disabled".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateSubdirectory(_))
        ));

        let mut config = SessionConfig::default();
        config.layout.trash_dir = "a/b".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSubdirectory(_))
        ));

        let mut config = SessionConfig::default();
        config.layout.hidden_prefix.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyHiddenPrefix)));
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("config.json");

        let mut config = SessionConfig::default();
        config.root_dir = Some(dir.path().to_path_buf());
        config.downloads.max_concurrent = 5;
        config.save(&path)?;

        let loaded = SessionConfig::load(&path)?;
        assert_eq!(loaded.root_dir.as_deref(), Some(dir.path()));
        assert_eq!(loaded.downloads.max_concurrent, 5);
        assert_eq!(loaded.layout, LayoutConfig::default());
        Ok(())
    }

    #[test]
    fn test_partial_file_uses_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "layout": { "hidden_prefix": "~" } }"#)?;

        let loaded = SessionConfig::load(&path)?;
        assert_eq!(loaded.layout.hidden_prefix, "~");
        assert_eq!(loaded.layout.disabled_dir, "disabled");
        assert_eq!(loaded.downloads.max_retries, 3);
        assert!(loaded.conflicts.include_workshop);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_default() -> Result<()> {
        let dir = tempdir()?;
        let loaded = SessionConfig::load(&dir.path().join("nope.json"))?;
        assert!(loaded.root_dir.is_none());
        Ok(())
    }

    #[test]
    fn test_validate_directory() -> Result<()> {
        let dir = tempdir()?;
        assert!(validate_directory(dir.path()).is_ok());

        let missing = dir.path().join("missing");
        assert!(matches!(
            validate_directory(&missing),
            Err(ConfigError::DirectoryNotFound(_))
        ));

        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x")?;
        assert!(matches!(
            validate_directory(&file),
            Err(ConfigError::NotADirectory(_))
        ));

        assert!(matches!(
            validate_directory(Path::new("")),
            Err(ConfigError::EmptyPath)
        ));

        // Probe file must not linger
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_cdn_host_match() {
        let config = DownloadConfig::default();
        assert!(config.is_cdn_host("CDN.steamusercontent.com"));
        assert!(!config.is_cdn_host("example.com"));
    }
}
