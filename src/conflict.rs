//! Conflict detection between installed archives
//!
//! Two archives conflict when both declare the same internal path; the game
//! silently loads only one of them. Conflicting paths are grouped by the
//! exact set of archives declaring them and graded by [`SeverityRules`].

use crate::catalog::Archive;
use crate::layout::{Layout, Location};
use crate::paths;
use crate::progress::Progress;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

/// Report progress every this many archives (and on the last one)
const PROGRESS_EVERY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// How a rule matches a normalized internal path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PathMatcher {
    Exact { path: String },
    Prefix { prefix: String },
    Suffix { suffix: String },
    PrefixSuffix { prefix: String, suffix: String },
}

impl PathMatcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact { path: p } => path == p,
            PathMatcher::Prefix { prefix } => path.starts_with(prefix.as_str()),
            PathMatcher::Suffix { suffix } => path.ends_with(suffix.as_str()),
            PathMatcher::PrefixSuffix { prefix, suffix } => {
                path.starts_with(prefix.as_str()) && path.ends_with(suffix.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityRule {
    pub matcher: PathMatcher,
    pub severity: Severity,
}

impl SeverityRule {
    fn exact(path: &str, severity: Severity) -> Self {
        Self {
            matcher: PathMatcher::Exact {
                path: path.to_string(),
            },
            severity,
        }
    }

    fn prefix(prefix: &str, severity: Severity) -> Self {
        Self {
            matcher: PathMatcher::Prefix {
                prefix: prefix.to_string(),
            },
            severity,
        }
    }

    fn suffix(suffix: &str, severity: Severity) -> Self {
        Self {
            matcher: PathMatcher::Suffix {
                suffix: suffix.to_string(),
            },
            severity,
        }
    }

    fn prefix_suffix(prefix: &str, suffix: &str, severity: Severity) -> Self {
        Self {
            matcher: PathMatcher::PrefixSuffix {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            },
            severity,
        }
    }
}

/// Ordered severity rules; the first match wins, unmatched paths are info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeverityRules {
    pub rules: Vec<SeverityRule>,
}

impl Default for SeverityRules {
    fn default() -> Self {
        use Severity::{Critical, Warning};

        let mut rules = vec![
            SeverityRule::exact("particles/particles_manifest.txt", Critical),
            SeverityRule::exact("scripts/soundmixers.txt", Critical),
            SeverityRule::suffix(".bsp", Critical),
            SeverityRule::suffix(".nav", Critical),
            SeverityRule::prefix_suffix("missions/", ".txt", Critical),
            // vscripts text is only a warning, so it must precede scripts/*.txt
            SeverityRule::prefix_suffix("scripts/vscripts/", ".txt", Warning),
            SeverityRule::prefix_suffix("scripts/", ".txt", Critical),
            SeverityRule::exact("sound/sound.cache", Warning),
            SeverityRule::suffix(".phy", Warning),
            SeverityRule::prefix_suffix("resource/", ".res", Warning),
            SeverityRule::prefix("scripts/vscripts/", Warning),
        ];
        rules.extend(
            [".vscript", ".nut", ".nuc", ".db", ".vtx", ".vvd", ".ttf", ".otf"]
                .into_iter()
                .map(|suffix| SeverityRule::suffix(suffix, Warning)),
        );
        Self { rules }
    }
}

impl SeverityRules {
    /// Grade one path; accepts raw paths and normalizes them first
    pub fn classify(&self, path: &str) -> Severity {
        let path = paths::normalize_for_lookup(path);
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(&path))
            .map(|rule| rule.severity)
            .unwrap_or(Severity::Info)
    }
}

/// Which archives and paths take part in a conflict check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictPolicy {
    /// Workshop archives are loaded by the game too
    pub include_workshop: bool,
    /// Normalized paths every addon ships; never a conflict
    pub ignored_paths: Vec<String>,
    /// Normalized prefixes that are never a conflict
    pub ignored_prefixes: Vec<String>,
    pub rules: SeverityRules,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            include_workshop: true,
            ignored_paths: vec![
                "addoninfo.txt".to_string(),
                "addonimage.jpg".to_string(),
                "addonimage.vtf".to_string(),
            ],
            ignored_prefixes: vec!["materials/dev/".to_string(), "materials/temp/".to_string()],
            rules: SeverityRules::default(),
        }
    }
}

impl ConflictPolicy {
    pub fn participates(&self, archive: &Archive) -> bool {
        match archive.location {
            Location::Root => true,
            Location::Workshop => self.include_workshop,
            Location::Disabled => false,
        }
    }

    pub fn is_ignored(&self, normalized: &str) -> bool {
        self.ignored_paths.iter().any(|p| p == normalized)
            || self
                .ignored_prefixes
                .iter()
                .any(|p| normalized.starts_with(p.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictPath {
    pub path: String,
    pub severity: Severity,
}

/// Paths shared by exactly the same set of archives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictGroup {
    /// Archive names relative to the root (`workshop/123.vpk`), sorted
    pub archives: Vec<String>,
    /// Conflicting paths, sorted
    pub paths: Vec<ConflictPath>,
    /// Highest severity among `paths`
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    /// Number of groups
    pub total: usize,
    pub groups: Vec<ConflictGroup>,
}

/// Find conflicting paths among participating archives
pub fn detect_conflicts(
    archives: &[Archive],
    layout: &Layout,
    policy: &ConflictPolicy,
    progress: Option<&(dyn Fn(Progress) + Sync)>,
) -> ConflictReport {
    let participants: Vec<&Archive> = archives
        .iter()
        .filter(|a| policy.participates(a))
        .collect();
    let total = participants.len();

    // normalized path -> names of archives declaring it
    let mut owners: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for (i, archive) in participants.iter().enumerate() {
        let current = i + 1;
        let name = layout.relative_name(&archive.path);

        if archive.parse_error.is_some() {
            debug!("Skipping unreadable archive {}", name);
        } else {
            let unique: HashSet<String> = archive
                .listing
                .iter()
                .map(|p| paths::normalize_for_lookup(p))
                .filter(|p| !p.is_empty() && !policy.is_ignored(p))
                .collect();
            for path in unique {
                owners.entry(path).or_default().insert(name.clone());
            }
        }

        if let Some(cb) = progress {
            if current % PROGRESS_EVERY == 0 || current == total {
                cb(Progress::new(current, total, format!("Checked {}", name)));
            }
        }
    }

    // archive set -> conflicting paths
    let mut grouped: BTreeMap<Vec<String>, Vec<ConflictPath>> = BTreeMap::new();
    for (path, names) in owners {
        if names.len() < 2 {
            continue;
        }
        let severity = policy.rules.classify(&path);
        grouped
            .entry(names.into_iter().collect())
            .or_default()
            .push(ConflictPath { path, severity });
    }

    let mut groups: Vec<ConflictGroup> = grouped
        .into_iter()
        .map(|(archives, paths)| {
            let severity = paths
                .iter()
                .map(|p| p.severity)
                .max()
                .unwrap_or(Severity::Info);
            ConflictGroup {
                archives,
                paths,
                severity,
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.paths.len().cmp(&a.paths.len()))
            .then_with(|| a.archives.cmp(&b.archives))
    });

    info!(
        "Conflict check: {} archives, {} conflict groups",
        total,
        groups.len()
    );

    ConflictReport {
        total: groups.len(),
        groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use std::sync::{Arc, Mutex};

    fn layout() -> Layout {
        Layout::new("/addons", &LayoutConfig::default())
    }

    fn archive(path: &str, location: Location, listing: &[&str]) -> Archive {
        let mut a = Archive::new(path, location);
        a.listing = listing.iter().map(|s| s.to_string()).collect::<Vec<_>>().into();
        a
    }

    #[test]
    fn test_default_severities() {
        let rules = SeverityRules::default();
        assert_eq!(rules.classify("scripts/vscripts/foo.nut"), Severity::Warning);
        assert_eq!(rules.classify("scripts/vscripts/director.txt"), Severity::Warning);
        assert_eq!(rules.classify("missions/custom.txt"), Severity::Critical);
        assert_eq!(rules.classify("Scripts\\weapon_rifle.txt"), Severity::Critical);
        assert_eq!(rules.classify("maps/c1m1.nav"), Severity::Critical);
        assert_eq!(rules.classify("sound/sound.cache"), Severity::Warning);
        assert_eq!(rules.classify("resource/ui.res"), Severity::Warning);
        assert_eq!(rules.classify("models/w.vvd"), Severity::Warning);
        assert_eq!(rules.classify("materials/skin.vtf"), Severity::Info);
    }

    #[test]
    fn test_custom_rules_override() {
        let rules = SeverityRules {
            rules: vec![SeverityRule::suffix(".vtf", Severity::Critical)],
        };
        assert_eq!(rules.classify("materials/skin.vtf"), Severity::Critical);
        assert_eq!(rules.classify("maps/a.bsp"), Severity::Info);
    }

    #[test]
    fn test_groups_by_archive_set() {
        let archives = vec![
            archive(
                "/addons/a.vpk",
                Location::Root,
                &["materials/skin.vtf", "maps/x.bsp", "addoninfo.txt"],
            ),
            archive(
                "/addons/b.vpk",
                Location::Root,
                &["MATERIALS/SKIN.VTF", "maps/x.bsp", "addoninfo.txt", "materials/dev/a.vmt"],
            ),
            archive("/addons/c.vpk", Location::Root, &["materials/skin.vtf", "materials/dev/a.vmt"]),
            archive("/addons/disabled/d.vpk", Location::Disabled, &["maps/x.bsp"]),
        ];

        let report = detect_conflicts(&archives, &layout(), &ConflictPolicy::default(), None);
        assert_eq!(report.total, 2);

        let first = &report.groups[0];
        assert_eq!(first.archives, vec!["a.vpk", "b.vpk"]);
        assert_eq!(first.severity, Severity::Critical);
        assert_eq!(
            first.paths,
            vec![ConflictPath {
                path: "maps/x.bsp".to_string(),
                severity: Severity::Critical
            }]
        );

        let second = &report.groups[1];
        assert_eq!(second.archives, vec!["a.vpk", "b.vpk", "c.vpk"]);
        assert_eq!(second.severity, Severity::Info);
    }

    #[test]
    fn test_workshop_policy() {
        let archives = vec![
            archive("/addons/a.vpk", Location::Root, &["models/a.mdl"]),
            archive("/addons/workshop/1.vpk", Location::Workshop, &["models/a.mdl"]),
        ];

        let report = detect_conflicts(&archives, &layout(), &ConflictPolicy::default(), None);
        assert_eq!(report.groups[0].archives, vec!["a.vpk", "workshop/1.vpk"]);

        let policy = ConflictPolicy {
            include_workshop: false,
            ..Default::default()
        };
        assert_eq!(detect_conflicts(&archives, &layout(), &policy, None).total, 0);
    }

    #[test]
    fn test_unreadable_archive_skipped() {
        let mut broken = archive("/addons/broken.vpk", Location::Root, &["models/a.mdl"]);
        broken.parse_error = Some("bad signature".to_string());
        let archives = vec![
            archive("/addons/a.vpk", Location::Root, &["models/a.mdl"]),
            broken,
        ];
        assert_eq!(
            detect_conflicts(&archives, &layout(), &ConflictPolicy::default(), None).total,
            0
        );
    }

    #[test]
    fn test_sorted_by_severity_then_size() {
        let archives = vec![
            archive("/addons/a.vpk", Location::Root, &["x/1.vtf", "x/2.vtf", "y.nut"]),
            archive("/addons/b.vpk", Location::Root, &["x/1.vtf", "x/2.vtf"]),
            archive("/addons/c.vpk", Location::Root, &["y.nut"]),
            archive("/addons/d.vpk", Location::Root, &["z.vtf", "w.vtf", "v.vtf"]),
            archive("/addons/e.vpk", Location::Root, &["z.vtf", "w.vtf", "v.vtf"]),
        ];
        let report = detect_conflicts(&archives, &layout(), &ConflictPolicy::default(), None);
        let order: Vec<_> = report.groups.iter().map(|g| g.archives.join("+")).collect();
        assert_eq!(order, vec!["a.vpk+c.vpk", "d.vpk+e.vpk", "a.vpk+b.vpk"]);
    }

    #[test]
    fn test_progress_cadence() {
        let archives: Vec<Archive> = (0..7)
            .map(|i| archive(&format!("/addons/{}.vpk", i), Location::Root, &["a.txt"]))
            .collect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb = move |p: Progress| sink.lock().unwrap().push((p.current, p.total));
        detect_conflicts(&archives, &layout(), &ConflictPolicy::default(), Some(&cb));
        assert_eq!(*seen.lock().unwrap(), vec![(5, 7), (7, 7)]);
    }
}
