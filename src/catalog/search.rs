//! Catalog search, filtering and sorting

use super::Archive;
use crate::layout::Location;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Name,
    Modified,
    LoadOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter archives by free text and tags.
///
/// - `query`: case-insensitive substring of file name, title or any tag
/// - `primary_tag`: exact (case-insensitive) match when non-empty
/// - `secondary_tags`: archive must carry at least one of them when non-empty
pub fn search(
    archives: &[Archive],
    query: &str,
    primary_tag: &str,
    secondary_tags: &[String],
) -> Vec<Archive> {
    let query = query.trim().to_lowercase();
    let primary_tag = primary_tag.trim();

    archives
        .iter()
        .filter(|a| query.is_empty() || matches_text(a, &query))
        .filter(|a| {
            primary_tag.is_empty()
                || a.metadata
                    .primary_tag()
                    .is_some_and(|t| t.as_str().eq_ignore_ascii_case(primary_tag))
        })
        .filter(|a| {
            secondary_tags.is_empty()
                || a.metadata
                    .secondary_tags()
                    .iter()
                    .any(|t| secondary_tags.contains(t))
        })
        .cloned()
        .collect()
}

fn matches_text(archive: &Archive, query: &str) -> bool {
    archive.name.to_lowercase().contains(query)
        || archive.title().to_lowercase().contains(query)
        || archive
            .metadata
            .primary_tag()
            .is_some_and(|t| t.as_str().contains(query))
        || archive
            .metadata
            .secondary_tags()
            .iter()
            .any(|t| t.to_lowercase().contains(query))
}

/// Keep archives in `location`
pub fn filter_location(mut archives: Vec<Archive>, location: Location) -> Vec<Archive> {
    archives.retain(|a| a.location == location);
    archives
}

/// Drop hidden archives unless `show_hidden`
pub fn filter_hidden(mut archives: Vec<Archive>, show_hidden: bool) -> Vec<Archive> {
    if !show_hidden {
        archives.retain(|a| !a.hidden);
    }
    archives
}

/// Case-insensitive comparison treating digit runs as numbers ("file2" < "file10")
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();

    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let left = take_digits(&mut a);
                let right = take_digits(&mut b);
                let l = left.trim_start_matches('0');
                let r = right.trim_start_matches('0');
                let ord = l
                    .len()
                    .cmp(&r.len())
                    .then_with(|| l.cmp(r))
                    .then_with(|| left.len().cmp(&right.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(c);
        chars.next();
    }
    digits
}

/// Sort archives in place (stable).
///
/// `LoadOrder` puts listed archives first by list position and the rest
/// after them by name; it ignores `order`.
pub fn sort_archives(archives: &mut [Archive], key: SortKey, order: SortOrder, load_order: Option<&[String]>) {
    let by_name = |a: &Archive, b: &Archive| natural_cmp(&a.name, &b.name).then_with(|| a.path.cmp(&b.path));

    match key {
        SortKey::Name => archives.sort_by(|a, b| directed(by_name(a, b), order)),
        SortKey::Modified => archives.sort_by(|a, b| {
            directed(
                a.modified
                    .cmp(&b.modified)
                    .then_with(|| natural_cmp(&a.name, &b.name)),
                order,
            )
        }),
        SortKey::LoadOrder => {
            let positions: HashMap<String, usize> = load_order
                .unwrap_or_default()
                .iter()
                .enumerate()
                .map(|(i, name)| (name.to_lowercase(), i))
                .collect();
            archives.sort_by(|a, b| {
                let pa = positions.get(&a.name.to_lowercase());
                let pb = positions.get(&b.name.to_lowercase());
                match (pa, pb) {
                    (Some(x), Some(y)) => x.cmp(y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => by_name(a, b),
                }
            });
        }
    }
}

fn directed(ord: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Ascending => ord,
        SortOrder::Descending => ord.reverse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpk::metadata::{BasicMetadata, ParsedMetadata, PrimaryTag};
    use chrono::{TimeZone, Utc};

    fn archive(name: &str) -> Archive {
        Archive::new(format!("/addons/{}", name), Location::Root)
    }

    fn tagged(name: &str, primary: PrimaryTag, secondary: &[&str]) -> Archive {
        let mut a = archive(name);
        a.metadata = ParsedMetadata::Basic(BasicMetadata {
            title: format!("{} title", name),
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

    fn names(archives: &[Archive]) -> Vec<&str> {
        archives.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn test_query_matches_names() {
        let all = vec![archive("Alpha.vpk"), archive("beta.vpk"), archive("Gamma.vpk")];
        assert_eq!(search(&all, "a", "", &[]).len(), 3);
        assert_eq!(names(&search(&all, "ALPHA", "", &[])), vec!["Alpha.vpk"]);
        assert_eq!(search(&all, "", "", &[]).len(), 3);
    }

    #[test]
    fn test_tag_filters() {
        let all = vec![
            tagged("a.vpk", PrimaryTag::Weapon, &["AK47"]),
            tagged("b.vpk", PrimaryTag::Weapon, &["M16"]),
            tagged("c.vpk", PrimaryTag::Character, &["Zoey", "Nick"]),
            archive("d.vpk"),
        ];
        assert_eq!(names(&search(&all, "", "weapon", &[])), vec!["a.vpk", "b.vpk"]);
        assert_eq!(names(&search(&all, "", "Weapon", &["M16".to_string()])), vec!["b.vpk"]);
        assert_eq!(
            names(&search(&all, "", "", &["Nick".to_string(), "AK47".to_string()])),
            vec!["a.vpk", "c.vpk"]
        );
        assert_eq!(names(&search(&all, "zoey", "", &[])), vec!["c.vpk"]);
        assert_eq!(names(&search(&all, "character", "", &[])), vec!["c.vpk"]);
        assert!(search(&all, "", "map", &[]).is_empty());
    }

    #[test]
    fn test_post_filters() {
        let mut hidden = archive("_h.vpk");
        hidden.hidden = true;
        let all = vec![
            archive("a.vpk"),
            hidden,
            Archive::new("/addons/disabled/b.vpk", Location::Disabled),
        ];
        assert_eq!(names(&filter_location(all.clone(), Location::Disabled)), vec!["b.vpk"]);
        assert_eq!(filter_hidden(all.clone(), false).len(), 2);
        assert_eq!(filter_hidden(all, true).len(), 3);
    }

    #[test]
    fn test_natural_cmp() {
        assert_eq!(natural_cmp("file2", "file10"), Ordering::Less);
        assert_eq!(natural_cmp("File10", "file9"), Ordering::Greater);
        assert_eq!(natural_cmp("abc", "ABC"), Ordering::Equal);
        assert_eq!(natural_cmp("a", "ab"), Ordering::Less);
        assert_eq!(natural_cmp("x01", "x1"), Ordering::Greater);
    }

    #[test]
    fn test_sort_by_name() {
        let mut all = vec![archive("file10.vpk"), archive("File2.vpk"), archive("alpha.vpk")];
        sort_archives(&mut all, SortKey::Name, SortOrder::Ascending, None);
        assert_eq!(names(&all), vec!["alpha.vpk", "File2.vpk", "file10.vpk"]);
        sort_archives(&mut all, SortKey::Name, SortOrder::Descending, None);
        assert_eq!(names(&all), vec!["file10.vpk", "File2.vpk", "alpha.vpk"]);
    }

    #[test]
    fn test_sort_by_modified() {
        let mut old = archive("b.vpk");
        old.modified = Utc.timestamp_opt(1_000, 0).unwrap();
        let mut new = archive("a.vpk");
        new.modified = Utc.timestamp_opt(2_000, 0).unwrap();
        let mut all = vec![new, old];
        sort_archives(&mut all, SortKey::Modified, SortOrder::Ascending, None);
        assert_eq!(names(&all), vec!["b.vpk", "a.vpk"]);
        sort_archives(&mut all, SortKey::Modified, SortOrder::Descending, None);
        assert_eq!(names(&all), vec!["a.vpk", "b.vpk"]);
    }

    #[test]
    fn test_sort_by_load_order_ignores_direction() {
        let order = vec!["b.vpk".to_string(), "A.VPK".to_string()];
        for direction in [SortOrder::Ascending, SortOrder::Descending] {
            let mut all = vec![archive("c.vpk"), archive("a.vpk"), archive("b.vpk")];
            sort_archives(&mut all, SortKey::LoadOrder, direction, Some(&order));
            assert_eq!(names(&all), vec!["b.vpk", "a.vpk", "c.vpk"]);
        }
    }
}
