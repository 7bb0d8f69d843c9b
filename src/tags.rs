//! File-name tag convention
//!
//! Users pin tags by renaming an archive to `[Primary,Sec1,Sec2]name.vpk`,
//! optionally preceded by the hidden prefix (`_[Weapon,AK47]rifle.vpk`).
//! Tags written this way override whatever the content classifier decided.

/// Tags embedded in a file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTags {
    pub primary: String,
    pub secondary: Vec<String>,
}

/// A file name split into hidden marker, tag block and remaining body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitName<'a> {
    pub hidden: bool,
    pub tags: Option<FilenameTags>,
    pub body: &'a str,
}

/// Split `name` according to the tag convention
pub fn split_name<'a>(name: &'a str, hidden_prefix: &str) -> SplitName<'a> {
    let (hidden, rest) = match name.strip_prefix(hidden_prefix) {
        Some(rest) if !hidden_prefix.is_empty() => (true, rest),
        _ => (false, name),
    };

    let tagged = rest
        .strip_prefix('[')
        .and_then(|inner| inner.find(']').map(|end| (&inner[..end], &inner[end + 1..])));

    match tagged {
        Some((content, body)) => {
            let mut parts = content.split(',').map(str::trim);
            let primary = parts.next().unwrap_or_default().to_string();
            let secondary = parts
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            SplitName {
                hidden,
                tags: Some(FilenameTags { primary, secondary }),
                body,
            }
        }
        None => SplitName {
            hidden,
            tags: None,
            body: rest,
        },
    }
}

/// Strip characters that would break the tag block
pub fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .filter(|c| !matches!(c, ',' | '[' | ']' | '/' | '\\'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Build `[prefix][tags]body`; an empty tag list yields no tag block
pub fn compose_name(hidden_prefix: Option<&str>, primary: &str, secondary: &[String], body: &str) -> String {
    let mut all: Vec<String> = Vec::with_capacity(secondary.len() + 1);
    let primary = sanitize_tag(primary);
    if !primary.is_empty() {
        all.push(primary);
    }
    all.extend(
        secondary
            .iter()
            .map(|t| sanitize_tag(t))
            .filter(|t| !t.is_empty()),
    );

    let prefix = hidden_prefix.unwrap_or_default();
    if all.is_empty() {
        format!("{}{}", prefix, body)
    } else {
        format!("{}[{}]{}", prefix, all.join(","), body)
    }
}
