//! Steam Workshop item lookup
//!
//! Resolves a workshop page URL (or bare id) to the item's file details via
//! the public details API, which takes a JSON array of ids.

use super::{DownloadError, DownloadSource};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

/// Upload-tool prefixes stripped from workshop file names
const FILENAME_PREFIXES: [&str; 2] = ["my l4d2addons", "myl4d2addons"];

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));

/// One item as returned by the details API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkshopFileDetails {
    pub result: i64,
    #[serde(rename = "publishedfileid", deserialize_with = "string_or_number")]
    pub published_file_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub creator: String,
    pub filename: String,
    /// Size in bytes as a decimal string
    #[serde(deserialize_with = "string_or_number")]
    pub file_size: String,
    pub file_url: String,
    pub preview_url: String,
    pub title: String,
    #[serde(rename = "file_description")]
    pub description: String,
}

impl WorkshopFileDetails {
    pub fn size_bytes(&self) -> u64 {
        parse_file_size(&self.file_size)
    }

    pub fn to_source(&self) -> DownloadSource {
        DownloadSource {
            workshop_id: Some(self.published_file_id.clone()),
            title: self.title.clone(),
            filename: clean_filename(&self.filename),
            preview_url: self.preview_url.clone(),
            file_url: self.file_url.clone(),
            expected_size: self.size_bytes(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Workshop id from a page URL (`?id=`) or the first run of digits
pub fn parse_workshop_id(input: &str) -> Result<String, DownloadError> {
    let input = input.trim();
    if let Ok(url) = reqwest::Url::parse(input) {
        if let Some((_, id)) = url.query_pairs().find(|(k, v)| k == "id" && !v.is_empty()) {
            return Ok(id.into_owned());
        }
    }

    DIGITS
        .find(input)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| DownloadError::InvalidUrl(format!("no workshop id in '{}'", input)))
}

/// Base name without upload-tool prefixes
pub fn clean_filename(filename: &str) -> String {
    let normalized = filename.replace('\\', "/");
    let mut name = normalized.rsplit('/').next().unwrap_or_default().to_string();

    for prefix in FILENAME_PREFIXES {
        if name
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        {
            name = name[prefix.len()..]
                .trim_start_matches([' ', '_', '-'])
                .to_string();
        }
    }
    name
}

/// Byte count from the API's decimal string; anything else is 0
pub fn parse_file_size(size: &str) -> u64 {
    size.trim().parse().unwrap_or(0)
}

/// Look up a workshop item
pub async fn get_workshop_details(
    client: &reqwest::Client,
    api_url: &str,
    workshop_url: &str,
) -> Result<WorkshopFileDetails, DownloadError> {
    let id = parse_workshop_id(workshop_url)?;
    debug!("Looking up workshop item {}", id);

    let response = client
        .post(api_url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(format!("[{}]", id))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            status: status.as_u16(),
            url: super::http::truncate_url(api_url),
        });
    }

    let details: Vec<WorkshopFileDetails> = response
        .json()
        .await
        .map_err(|e| DownloadError::Workshop(format!("invalid response: {}", e)))?;

    let mut item = details
        .into_iter()
        .next()
        .ok_or_else(|| DownloadError::Workshop(format!("no details for {}", id)))?;

    if item.result != 1 {
        return Err(DownloadError::Workshop(format!(
            "item {} unavailable (result {})",
            id, item.result
        )));
    }

    item.creator.clear();
    item.filename = clean_filename(&item.filename);
    info!("Workshop item {}: {} ({})", id, item.title, item.filename);
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workshop_id() {
        assert_eq!(
            parse_workshop_id("https://steamcommunity.com/sharedfiles/filedetails/?id=123456&searchtext=").unwrap(),
            "123456"
        );
        assert_eq!(parse_workshop_id("  987654 ").unwrap(), "987654");
        assert_eq!(
            parse_workshop_id("https://steamcommunity.com/workshop/2837/").unwrap(),
            "2837"
        );
        assert!(parse_workshop_id("https://example.com/none").is_err());
    }

    #[test]
    fn test_clean_filename() {
        assert_eq!(clean_filename("myl4d2addons/skin.vpk"), "skin.vpk");
        assert_eq!(clean_filename("myl4d2addons\\skin.vpk"), "skin.vpk");
        assert_eq!(clean_filename("MyL4D2Addons_ - map.vpk"), "map.vpk");
        assert_eq!(clean_filename("my l4d2addons rifle.vpk"), "rifle.vpk");
        assert_eq!(clean_filename("plain.vpk"), "plain.vpk");
    }

    #[test]
    fn test_parse_file_size() {
        assert_eq!(parse_file_size("1048576"), 1_048_576);
        assert_eq!(parse_file_size("12 MB"), 0);
        assert_eq!(parse_file_size(""), 0);
    }

    #[test]
    fn test_details_deserialize() {
        let json = r#"[{"result":1,"publishedfileid":"42","creator":76561198000000000,
            "filename":"myl4d2addons/a.vpk","file_size":"2048","file_url":"https://x/y",
            "preview_url":"","title":"A","file_description":"desc"}]"#;
        let details: Vec<WorkshopFileDetails> = serde_json::from_str(json).unwrap();
        let item = &details[0];
        assert_eq!(item.published_file_id, "42");
        assert_eq!(item.creator, "76561198000000000");
        assert_eq!(item.size_bytes(), 2048);

        let source = item.to_source();
        assert_eq!(source.filename, "a.vpk");
        assert_eq!(source.workshop_id.as_deref(), Some("42"));
        assert_eq!(source.expected_size, 2048);
    }
}
