//! Random mod rotation
//!
//! For every built-in character or weapon tag that has an enabled archive,
//! one archive carrying that tag is picked at random and enabled; the other
//! enabled archives with the tag are disabled. Archives in the workshop
//! directory cannot be toggled and never take part.

use crate::catalog::Archive;
use crate::layout::Location;
use crate::mutator::{BatchResult, Mutator};
use crate::vpk::metadata::{self, PrimaryTag};
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use tracing::{debug, info};

/// Which categories rotate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub enable_characters: bool,
    pub enable_weapons: bool,
}

impl RotationConfig {
    pub fn is_enabled(&self) -> bool {
        self.enable_characters || self.enable_weapons
    }

    pub fn covers(&self, primary: PrimaryTag) -> bool {
        match primary {
            PrimaryTag::Character => self.enable_characters,
            PrimaryTag::Weapon => self.enable_weapons,
            PrimaryTag::Map | PrimaryTag::Other => false,
        }
    }
}

/// What a rotation will do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationPlan {
    /// Tag -> archive chosen for it
    pub picks: BTreeMap<String, PathBuf>,
    pub disable: Vec<PathBuf>,
    pub enable: Vec<PathBuf>,
}

impl RotationPlan {
    pub fn is_empty(&self) -> bool {
        self.disable.is_empty() && self.enable.is_empty()
    }
}

/// Result of [`rotate`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    /// Tag -> file name of the archive now in use
    pub picks: BTreeMap<String, String>,
    pub disabled: BatchResult,
    pub enabled: BatchResult,
}

/// Built-in tags an archive rotates under
fn rotating_tags<'a>(archive: &'a Archive, config: &RotationConfig) -> Vec<&'a str> {
    let Some(primary) = archive.metadata.primary_tag() else {
        return Vec::new();
    };
    if !config.covers(primary) || archive.location == Location::Workshop {
        return Vec::new();
    }
    archive
        .metadata
        .secondary_tags()
        .iter()
        .map(String::as_str)
        .filter(|tag| metadata::is_builtin_tag(primary, tag))
        .collect()
}

/// Decide which archives to disable and enable
pub fn plan<R: Rng + ?Sized>(archives: &[Archive], config: &RotationConfig, rng: &mut R) -> RotationPlan {
    let mut plan = RotationPlan::default();
    if !config.is_enabled() {
        return plan;
    }

    let candidates: Vec<(&Archive, Vec<&str>)> = archives
        .iter()
        .map(|a| (a, rotating_tags(a, config)))
        .filter(|(_, tags)| !tags.is_empty())
        .collect();

    // Only tags somebody is currently using rotate
    let active: BTreeSet<&str> = candidates
        .iter()
        .filter(|(a, _)| a.enabled())
        .flat_map(|(_, tags)| tags.iter().copied())
        .collect();

    let mut keep = HashSet::new();
    let mut retire = BTreeSet::new();
    for tag in active {
        let pool: Vec<&Archive> = candidates
            .iter()
            .filter(|(_, tags)| tags.contains(&tag))
            .map(|(a, _)| *a)
            .collect();
        let Some(chosen) = pool.choose(rng) else {
            continue;
        };
        debug!("Rotation picked {} for [{}] out of {}", chosen.name, tag, pool.len());

        plan.picks.insert(tag.to_string(), chosen.path.clone());
        keep.insert(chosen.path.clone());
        if !chosen.enabled() {
            plan.enable.push(chosen.path.clone());
        }
        retire.extend(
            pool.iter()
                .filter(|a| a.enabled() && a.path != chosen.path)
                .map(|a| a.path.clone()),
        );
    }

    // An archive picked for one tag stays even if another tag dropped it
    plan.disable = retire.into_iter().filter(|p| !keep.contains(p)).collect();
    plan.enable.sort();
    plan.enable.dedup();
    plan
}

/// Apply a plan, disabling first so a slot is never doubled up
pub fn apply(mutator: &Mutator, plan: &RotationPlan) -> RotationReport {
    let disabled = mutator.disable_many(&plan.disable);
    let enabled = mutator.enable_many(&plan.enable);
    info!(
        "Rotated {} tag(s): {} disabled, {} enabled",
        plan.picks.len(),
        disabled.success,
        enabled.success
    );

    RotationReport {
        picks: plan
            .picks
            .iter()
            .map(|(tag, path)| (tag.clone(), crate::paths::display_name(path)))
            .collect(),
        disabled,
        enabled,
    }
}

/// Plan with the thread RNG and apply
pub fn rotate(mutator: &Mutator, archives: &[Archive], config: &RotationConfig) -> RotationReport {
    let plan = plan(archives, config, &mut rand::rng());
    if plan.picks.is_empty() {
        debug!("Nothing to rotate");
    }
    apply(mutator, &plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use crate::layout::Layout;
    use crate::vpk::metadata::{BasicMetadata, ParsedMetadata};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::path::Path;
    use tempfile::tempdir;

    fn tagged(dir: &Path, name: &str, location: Location, primary: PrimaryTag, secondary: &[&str]) -> Archive {
        let mut a = Archive::new(dir.join(name), location);
        a.metadata = ParsedMetadata::Basic(BasicMetadata {
            title: name.to_string(),
            author: String::new(),
            version: String::new(),
            description: String::new(),
            url: String::new(),
            primary_tag: primary,
            secondary_tags: secondary.iter().map(|s| s.to_string()).collect(),
            map: None,
        });
        a
    }

    fn both() -> RotationConfig {
        RotationConfig {
            enable_characters: true,
            enable_weapons: true,
        }
    }

    #[test]
    fn test_disabled_config_plans_nothing() {
        let root = Path::new("/addons");
        let archives = vec![tagged(root, "a.vpk", Location::Root, PrimaryTag::Weapon, &["AK47"])];
        let plan = plan(&archives, &RotationConfig::default(), &mut StdRng::seed_from_u64(1));
        assert_eq!(plan, RotationPlan::default());
    }

    #[test]
    fn test_one_archive_per_active_tag() {
        let root = Path::new("/addons");
        let disabled = root.join("disabled");
        let archives = vec![
            tagged(root, "ak_a.vpk", Location::Root, PrimaryTag::Weapon, &["AK47"]),
            tagged(root, "ak_b.vpk", Location::Root, PrimaryTag::Weapon, &["AK47"]),
            tagged(&disabled, "ak_c.vpk", Location::Disabled, PrimaryTag::Weapon, &["AK47"]),
            // No enabled M16, so it stays as is
            tagged(&disabled, "m16.vpk", Location::Disabled, PrimaryTag::Weapon, &["M16"]),
            // Custom tags never rotate
            tagged(root, "mine.vpk", Location::Root, PrimaryTag::Weapon, &["My Skin"]),
        ];

        for seed in 0..20 {
            let plan = plan(&archives, &both(), &mut StdRng::seed_from_u64(seed));
            assert_eq!(plan.picks.keys().collect::<Vec<_>>(), vec!["AK47"]);

            let chosen = &plan.picks["AK47"];
            let enabled_after: Vec<&PathBuf> = archives[..3]
                .iter()
                .map(|a| &a.path)
                .filter(|p| {
                    let was_enabled = archives.iter().any(|a| &a.path == *p && a.enabled());
                    (was_enabled && !plan.disable.contains(*p)) || plan.enable.contains(*p)
                })
                .collect();
            assert_eq!(enabled_after, vec![chosen]);
            assert!(!plan.disable.contains(&archives[4].path));
        }
    }

    #[test]
    fn test_category_switches() {
        let root = Path::new("/addons");
        let disabled = root.join("disabled");
        let archives = vec![
            tagged(root, "zoey_a.vpk", Location::Root, PrimaryTag::Character, &["Zoey"]),
            tagged(&disabled, "zoey_b.vpk", Location::Disabled, PrimaryTag::Character, &["Zoey"]),
            tagged(root, "ak.vpk", Location::Root, PrimaryTag::Weapon, &["AK47"]),
        ];
        let weapons_only = RotationConfig {
            enable_characters: false,
            enable_weapons: true,
        };
        let plan = plan(&archives, &weapons_only, &mut StdRng::seed_from_u64(7));
        assert_eq!(plan.picks.keys().collect::<Vec<_>>(), vec!["AK47"]);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_workshop_never_rotates() {
        let root = Path::new("/addons");
        let archives = vec![
            tagged(root, "ak.vpk", Location::Root, PrimaryTag::Weapon, &["AK47"]),
            tagged(&root.join("workshop"), "ws.vpk", Location::Workshop, PrimaryTag::Weapon, &["AK47"]),
        ];
        for seed in 0..10 {
            let plan = plan(&archives, &both(), &mut StdRng::seed_from_u64(seed));
            assert_eq!(plan.picks["AK47"], archives[0].path);
            assert!(plan.is_empty());
        }
    }

    #[test]
    fn test_apply_moves_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let layout = Layout::new(dir.path(), &LayoutConfig::default());
        std::fs::create_dir_all(&layout.disabled)?;
        let on = dir.path().join("on.vpk");
        let off = layout.disabled.join("off.vpk");
        std::fs::write(&on, b"vpk")?;
        std::fs::write(&off, b"vpk")?;

        let plan = RotationPlan {
            picks: BTreeMap::from([("AK47".to_string(), off.clone())]),
            disable: vec![on.clone()],
            enable: vec![off.clone()],
        };
        let report = apply(&Mutator::new(layout.clone()), &plan);

        assert_eq!(report.disabled.success, 1);
        assert_eq!(report.enabled.success, 1);
        assert_eq!(report.picks["AK47"], "off.vpk");
        assert!(layout.disabled.join("on.vpk").exists());
        assert!(dir.path().join("off.vpk").exists());
        Ok(())
    }
}
