//! Archive metadata model and content classification
//!
//! Classification looks at the internal path listing first (maps, survivor
//! models, weapon assets) and refines secondary tags from the descriptor
//! text or asset file names.

use super::keyvalues::{self, AddonInfo};
use crate::paths;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Top-level category of an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryTag {
    Map,
    Character,
    Weapon,
    Other,
}

impl PrimaryTag {
    /// Canonical vocabulary order
    pub const ALL: [PrimaryTag; 4] = [
        PrimaryTag::Map,
        PrimaryTag::Character,
        PrimaryTag::Weapon,
        PrimaryTag::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrimaryTag::Map => "map",
            PrimaryTag::Character => "character",
            PrimaryTag::Weapon => "weapon",
            PrimaryTag::Other => "other",
        }
    }

    /// Parse a tag typed by a user or found in a file name.
    ///
    /// Also accepts the Chinese labels older tooling wrote into file names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "map" | "maps" | "campaign" | "地图" => Some(PrimaryTag::Map),
            "character" | "characters" | "survivor" | "人物" => Some(PrimaryTag::Character),
            "weapon" | "weapons" | "武器" => Some(PrimaryTag::Weapon),
            "other" | "misc" | "其他" => Some(PrimaryTag::Other),
            _ => None,
        }
    }
}

impl fmt::Display for PrimaryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One playable chapter of a campaign
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterInfo {
    pub title: String,
    /// Game modes offering this chapter (`coop`, `versus`, ...)
    pub modes: Vec<String>,
}

/// Campaign details for map archives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInfo {
    pub campaign: String,
    /// Chapter code (`c1m1_hotel`) -> chapter details
    pub chapters: BTreeMap<String, ChapterInfo>,
}

/// Descriptor fields plus classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicMetadata {
    pub title: String,
    pub author: String,
    pub version: String,
    pub description: String,
    pub url: String,
    pub primary_tag: PrimaryTag,
    pub secondary_tags: Vec<String>,
    /// Present only when `primary_tag` is [`PrimaryTag::Map`]
    pub map: Option<MapInfo>,
}

/// Parsed metadata of an archive; `None` when the archive could not be read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParsedMetadata {
    #[default]
    None,
    Basic(BasicMetadata),
}

impl ParsedMetadata {
    pub fn basic(&self) -> Option<&BasicMetadata> {
        match self {
            ParsedMetadata::Basic(meta) => Some(meta),
            ParsedMetadata::None => None,
        }
    }

    pub fn title(&self) -> &str {
        self.basic().map(|m| m.title.as_str()).unwrap_or_default()
    }

    pub fn primary_tag(&self) -> Option<PrimaryTag> {
        self.basic().map(|m| m.primary_tag)
    }

    pub fn secondary_tags(&self) -> &[String] {
        self.basic().map(|m| m.secondary_tags.as_slice()).unwrap_or_default()
    }
}

/// Where a preview image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PreviewImage {
    /// Image stored inside the archive at this internal path
    Embedded { entry: String },
    /// Image file next to the archive
    Sidecar { path: PathBuf },
}

/// Survivor model name fragments -> display names
const SURVIVORS: [(&str, &str); 8] = [
    ("namvet", "Bill"),
    ("biker", "Francis"),
    ("manager", "Louis"),
    ("teenangst", "Zoey"),
    ("gambler", "Nick"),
    ("producer", "Rochelle"),
    ("coach", "Coach"),
    ("mechanic", "Ellis"),
];

/// Path prefixes identifying survivor replacements
const CHARACTER_PREFIXES: [&str; 2] = ["models/survivors/", "materials/models/survivors/"];

/// Path prefixes identifying weapon replacements
const WEAPON_PREFIXES: [&str; 5] = [
    "models/weapons/",
    "models/v_models/",
    "models/w_models/",
    "materials/models/weapons/",
    "sound/weapons/",
];

/// Asset types inspected when guessing a weapon from file names
const WEAPON_ASSET_EXTENSIONS: [&str; 5] = ["mdl", "vmt", "vtf", "wav", "mp3"];

/// Descriptor keywords -> weapon tag, checked in order
const WEAPON_TEXT_RULES: &[(&str, &str)] = &[
    ("ak47", "AK47"),
    ("ak-47", "AK47"),
    ("m16", "M16"),
    ("sg552", "SG552"),
    ("scar", "SCAR"),
    ("combat rifle", "SCAR"),
    ("combat-rifle", "SCAR"),
    ("desert rifle", "SCAR"),
    ("desert-rifle", "SCAR"),
    ("m60", "M60"),
    ("uzi", "Uzi"),
    ("silenced smg", "Silenced SMG"),
    ("silenced-smg", "Silenced SMG"),
    ("mac 10", "Silenced SMG"),
    ("mac-10", "Silenced SMG"),
    ("mac10", "Silenced SMG"),
    ("mp5", "MP5"),
    ("hunting rifle", "Hunting Rifle"),
    ("hunting-rifle", "Hunting Rifle"),
    ("mini14", "Hunting Rifle"),
    ("military sniper", "Military Sniper"),
    ("military-sniper", "Military Sniper"),
    ("scout", "Scout"),
    ("awp", "AWP"),
    ("chrome", "Chrome Shotgun"),
    ("pump shotgun", "Pump Shotgun"),
    ("pump-shotgun", "Pump Shotgun"),
    ("auto shotgun", "Auto Shotgun"),
    ("auto-shotgun", "Auto Shotgun"),
    ("autoshotgun", "Auto Shotgun"),
    ("spas", "SPAS"),
    ("magnum", "Magnum"),
    ("desert eagle", "Magnum"),
    ("desert-eagle", "Magnum"),
    ("glock", "Pistol"),
    ("p220", "Pistol"),
    ("pistol", "Pistol"),
    ("grenade launcher", "Grenade Launcher"),
    ("grenade-launcher", "Grenade Launcher"),
    ("machete", "Machete"),
    ("katana", "Katana"),
    ("baseball bat", "Baseball Bat"),
    ("knife", "Knife"),
    ("chainsaw", "Chainsaw"),
    ("crowbar", "Crowbar"),
    ("fireaxe", "Fire Axe"),
    ("frying pan", "Frying Pan"),
    ("guitar", "Guitar"),
    ("cricket bat", "Cricket Bat"),
    ("tonfa", "Tonfa"),
    ("nightstick", "Tonfa"),
    ("golf club", "Golf Club"),
    ("shovel", "Shovel"),
    ("pitchfork", "Pitchfork"),
];

/// Asset file name fragments -> weapon tag; specific fragments come first
const WEAPON_FILE_RULES: &[(&str, &str)] = &[
    ("grenade_launcher", "Grenade Launcher"),
    ("w_desert_eagle", "Magnum"),
    ("magnum", "Magnum"),
    ("desert_rifle", "SCAR"),
    ("sniper_military", "Military Sniper"),
    ("sniper_scout", "Scout"),
    ("awp", "AWP"),
    ("sniper_mini14", "Hunting Rifle"),
    ("hunting_rifle", "Hunting Rifle"),
    ("sniper_a", "Military Sniper"),
    ("autoshotgun", "Auto Shotgun"),
    ("spas", "SPAS"),
    ("chrome", "Chrome Shotgun"),
    ("m1014", "Chrome Shotgun"),
    ("pumpshotgun", "Pump Shotgun"),
    ("w_shotgun", "Pump Shotgun"),
    ("smg_silenced", "Silenced SMG"),
    ("smg_a", "Silenced SMG"),
    ("uzi", "Uzi"),
    ("mp5", "MP5"),
    ("ak47", "AK47"),
    ("m16", "M16"),
    ("sg552", "SG552"),
    ("m60", "M60"),
    ("desert", "SCAR"),
    ("pistol_glock", "Pistol"),
    ("pistol_b", "Pistol"),
    ("machete", "Machete"),
    ("katana", "Katana"),
    ("baseball_bat", "Baseball Bat"),
    ("w_bat", "Baseball Bat"),
    ("knife", "Knife"),
    ("chainsaw", "Chainsaw"),
    ("crowbar", "Crowbar"),
    ("fireaxe", "Fire Axe"),
    ("frying_pan", "Frying Pan"),
    ("electric_guitar", "Guitar"),
    ("w_guitar", "Guitar"),
    ("cricket_bat", "Cricket Bat"),
    ("tonfa", "Tonfa"),
    ("golf_club", "Golf Club"),
    ("shovel", "Shovel"),
    ("pitchfork", "Pitchfork"),
];

/// Whether `tag` is one the classifier itself produces for `primary`
pub fn is_builtin_tag(primary: PrimaryTag, tag: &str) -> bool {
    match primary {
        PrimaryTag::Character => SURVIVORS.iter().any(|(_, name)| *name == tag),
        PrimaryTag::Weapon => WEAPON_TEXT_RULES
            .iter()
            .chain(WEAPON_FILE_RULES)
            .any(|(_, weapon)| *weapon == tag),
        PrimaryTag::Map | PrimaryTag::Other => false,
    }
}

/// `scar` must be a whole word so "oscar" does not count
static SCAR_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bscar\b").expect("valid regex"));

fn is_map_path(path: &str) -> bool {
    (path.starts_with("maps/") && path.ends_with(".bsp"))
        || (path.starts_with("missions/") && path.ends_with(".txt"))
}

fn is_character_path(path: &str) -> bool {
    CHARACTER_PREFIXES.iter().any(|p| path.starts_with(p))
}

fn is_weapon_path(path: &str) -> bool {
    WEAPON_PREFIXES.iter().any(|p| path.starts_with(p))
        || (path.starts_with("scripts/weapon_") && path.ends_with(".txt"))
}

/// Decide the primary tag from normalized internal paths
pub fn detect_primary(normalized: &[String]) -> PrimaryTag {
    if normalized.iter().any(|p| is_map_path(p)) {
        PrimaryTag::Map
    } else if normalized.iter().any(|p| is_character_path(p)) {
        PrimaryTag::Character
    } else if normalized.iter().any(|p| is_weapon_path(p)) {
        PrimaryTag::Weapon
    } else {
        PrimaryTag::Other
    }
}

/// Survivors replaced by a character archive, in name order
pub fn detect_survivors(normalized: &[String]) -> Vec<String> {
    let mut found = BTreeSet::new();
    for path in normalized.iter().filter(|p| is_character_path(p)) {
        let name = paths::file_name(path);
        for (fragment, survivor) in SURVIVORS {
            if name.contains(fragment) {
                found.insert(survivor.to_string());
            }
        }
    }
    found.into_iter().collect()
}

/// Weapon named in free text (title + description)
pub fn weapon_from_text(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    WEAPON_TEXT_RULES
        .iter()
        .find(|(keyword, _)| {
            if *keyword == "scar" {
                SCAR_WORD.is_match(&lower)
            } else {
                lower.contains(keyword)
            }
        })
        .map(|(_, tag)| *tag)
}

/// Weapon guessed from asset file names
pub fn weapon_from_files(normalized: &[String]) -> Option<&'static str> {
    normalized
        .iter()
        .filter(|p| {
            paths::extension(p)
                .is_some_and(|ext| WEAPON_ASSET_EXTENSIONS.contains(&ext))
        })
        .find_map(|p| {
            let name = paths::file_name(p);
            WEAPON_FILE_RULES
                .iter()
                .find(|(fragment, _)| name.contains(fragment))
                .map(|(_, tag)| *tag)
        })
}

/// Build campaign info from decoded `missions/*.txt` documents.
///
/// Chapters listed by the mission files win; any `maps/*.bsp` not mentioned
/// there is added with its code as title so the chapter list is complete.
pub fn build_map_info(missions: &[String], normalized: &[String], fallback_title: &str) -> MapInfo {
    let mut info = MapInfo::default();

    for text in missions {
        let nodes = keyvalues::parse(text);
        let Some(mission) = keyvalues::find(&nodes, "mission") else {
            continue;
        };

        if info.campaign.is_empty() {
            let title = mission
                .get_str("DisplayTitle")
                .or_else(|| mission.get_str("Name"))
                .unwrap_or_default();
            info.campaign = title.trim().to_string();
        }

        let Some(modes) = mission.get("modes") else {
            continue;
        };
        for mode in modes.children() {
            let mode_name = mode.key.to_lowercase();
            for chapter in mode.children() {
                let Some(code) = chapter.get_str("Map").map(str::trim).filter(|c| !c.is_empty())
                else {
                    continue;
                };
                let entry = info.chapters.entry(code.to_string()).or_default();
                if entry.title.is_empty() {
                    entry.title = chapter
                        .get_str("DisplayName")
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| code.to_string());
                }
                if !entry.modes.contains(&mode_name) {
                    entry.modes.push(mode_name.clone());
                }
            }
        }
    }

    for path in normalized {
        if let Some(code) = path
            .strip_prefix("maps/")
            .and_then(|rest| rest.strip_suffix(".bsp"))
            .filter(|code| !code.contains('/'))
        {
            let known = info
                .chapters
                .keys()
                .any(|k| k.eq_ignore_ascii_case(code));
            if !known {
                info.chapters.insert(
                    code.to_string(),
                    ChapterInfo {
                        title: code.to_string(),
                        modes: Vec::new(),
                    },
                );
            }
        }
    }

    if info.campaign.is_empty() {
        info.campaign = fallback_title.to_string();
    }
    info
}

/// Modes offered by any chapter, used as secondary tags for maps
pub fn map_modes(info: &MapInfo) -> Vec<String> {
    info.chapters
        .values()
        .flat_map(|c| c.modes.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Classify an archive from its listing, descriptor and mission files
pub fn classify(normalized: &[String], addon: &AddonInfo, missions: &[String]) -> BasicMetadata {
    let primary = detect_primary(normalized);

    let (secondary, map) = match primary {
        PrimaryTag::Map => {
            let info = build_map_info(missions, normalized, &addon.title);
            (map_modes(&info), Some(info))
        }
        PrimaryTag::Character => (detect_survivors(normalized), None),
        PrimaryTag::Weapon => {
            let text = format!("{} {}", addon.title, addon.description);
            let weapon = Some(text.trim())
                .filter(|t| !t.is_empty())
                .and_then(weapon_from_text)
                .or_else(|| weapon_from_files(normalized));
            (weapon.map(|w| vec![w.to_string()]).unwrap_or_default(), None)
        }
        PrimaryTag::Other => (Vec::new(), None),
    };

    BasicMetadata {
        title: addon.title.clone(),
        author: addon.author.clone(),
        version: addon.version.clone(),
        description: addon.description.clone(),
        url: addon.url.clone(),
        primary_tag: primary,
        secondary_tags: secondary,
        map,
    }
}

/// Apply `[Primary,Sec...]` tags from the file name.
///
/// An empty primary keeps the detected one; an unknown primary becomes
/// `other` and is kept as the first secondary tag so nothing typed is lost.
pub fn apply_filename_tags(meta: &mut BasicMetadata, tags: &crate::tags::FilenameTags) {
    let mut secondary = Vec::new();
    if !tags.primary.is_empty() {
        match PrimaryTag::parse(&tags.primary) {
            Some(primary) => meta.primary_tag = primary,
            None => {
                meta.primary_tag = PrimaryTag::Other;
                secondary.push(tags.primary.clone());
            }
        }
    }
    secondary.extend(tags.secondary.iter().cloned());
    meta.secondary_tags = secondary;
    if meta.primary_tag != PrimaryTag::Map {
        meta.map = None;
    }
}
