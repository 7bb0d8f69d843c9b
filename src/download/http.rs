//! HTTP client with stall detection, cancellation and progress tracking

use super::DownloadError;
use crate::config::DownloadConfig;
use futures::StreamExt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Connection timeout: time to establish TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout: maximum time to wait for data between chunks
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Stall detection: fail if no bytes arrive for this long
const STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// How often to invoke the progress callback
const CALLBACK_INTERVAL: Duration = Duration::from_millis(250);

const USER_AGENT: &str = concat!("vpkhub/", env!("CARGO_PKG_VERSION"));

/// Content types that mean the server sent a page instead of a file
const REJECTED_CONTENT_TYPES: [&str; 2] = ["text/html", "application/json"];

/// Progress callback: (downloaded_bytes, total_bytes, bytes_per_second)
pub type ProgressCallback<'a> = &'a (dyn Fn(u64, u64, f64) + Send + Sync);

/// Shared HTTP client
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    use_system_proxy: bool,
}

impl HttpClient {
    pub fn new(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let client = builder(config.use_system_proxy)
            .build()
            .map_err(|e| DownloadError::Client(e.to_string()))?;

        Ok(Self {
            client,
            use_system_proxy: config.use_system_proxy,
        })
    }

    /// A client that connects to `ip` whenever it talks to `host`
    pub fn pinned(&self, host: &str, ip: IpAddr) -> Result<Self, DownloadError> {
        // Port 0 keeps the port from the URL
        let client = builder(self.use_system_proxy)
            .resolve(host, SocketAddr::new(ip, 0))
            .build()
            .map_err(|e| DownloadError::Client(e.to_string()))?;

        Ok(Self {
            client,
            use_system_proxy: self.use_system_proxy,
        })
    }

    /// Get the underlying reqwest client
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

fn builder(use_system_proxy: bool) -> reqwest::ClientBuilder {
    let builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT);
    if use_system_proxy {
        builder
    } else {
        builder.no_proxy()
    }
}

/// What a finished transfer produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes: u64,
    pub total: u64,
    /// File name suggested by `Content-Disposition`
    pub suggested_name: Option<String>,
}

/// Download `url` into `output_path`, truncating any previous content.
///
/// Checked against `cancel` on every read. The callback fires at most every
/// 250 ms plus once at the end.
pub async fn fetch_to_file(
    client: &HttpClient,
    url: &str,
    output_path: &Path,
    expected_size: Option<u64>,
    cancel: &CancellationToken,
    progress_callback: ProgressCallback<'_>,
) -> Result<FetchOutcome, DownloadError> {
    let request = client
        .inner()
        .get(url)
        .header(reqwest::header::ACCEPT, "*/*")
        .header(reqwest::header::REFERER, "https://steamcommunity.com/");

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        response = request.send() => response?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            status: status.as_u16(),
            url: truncate_url(url),
        });
    }

    if let Some(content_type) = header_str(&response, reqwest::header::CONTENT_TYPE) {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if REJECTED_CONTENT_TYPES.contains(&essence.as_str()) {
            return Err(DownloadError::InvalidContentType(essence));
        }
    }

    let suggested_name = header_str(&response, reqwest::header::CONTENT_DISPOSITION)
        .and_then(|value| disposition_filename(&value));

    let total = expected_size
        .filter(|size| *size > 0)
        .or_else(|| response.content_length())
        .unwrap_or(0);

    let io_err = |source: std::io::Error| DownloadError::Io {
        path: output_path.to_path_buf(),
        source,
    };
    let mut file = File::create(output_path).await.map_err(io_err)?;

    let start = Instant::now();
    let mut last_callback = Instant::now();
    let mut downloaded = 0u64;
    let mut stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = tokio::time::timeout(STALL_TIMEOUT, stream.next()) => match next {
                Err(_) => {
                    warn!("Download stalled - no data for {:?}: {}", STALL_TIMEOUT, truncate_url(url));
                    return Err(DownloadError::Stalled(STALL_TIMEOUT.as_secs()));
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            },
        };

        file.write_all(&chunk).await.map_err(io_err)?;
        downloaded += chunk.len() as u64;

        if last_callback.elapsed() >= CALLBACK_INTERVAL {
            progress_callback(downloaded, total, bytes_per_second(downloaded, start));
            last_callback = Instant::now();
        }
    }

    file.flush().await.map_err(io_err)?;
    progress_callback(downloaded, total.max(downloaded), bytes_per_second(downloaded, start));
    debug!("Fetched {} bytes from {}", downloaded, truncate_url(url));

    Ok(FetchOutcome {
        bytes: downloaded,
        total: total.max(downloaded),
        suggested_name,
    })
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn bytes_per_second(bytes: u64, start: Instant) -> f64 {
    let elapsed = start.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        bytes as f64 / elapsed
    } else {
        0.0
    }
}

/// `filename` parameter of a `Content-Disposition` header
pub fn disposition_filename(value: &str) -> Option<String> {
    let mut plain = None;
    for param in value.split(';').skip(1) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim();
        match key.as_str() {
            "filename*" => {
                // RFC 5987: charset'lang'percent-encoded
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
                let decoded: Vec<(String, String)> =
                    serde_urlencoded::from_str(&format!("f={}", encoded.replace('+', "%2B"))).ok()?;
                if let Some((_, name)) = decoded.into_iter().next() {
                    if !name.is_empty() {
                        return Some(name);
                    }
                }
            }
            "filename" => {
                let name = raw.trim_matches('"').to_string();
                if !name.is_empty() {
                    plain = Some(name);
                }
            }
            _ => {}
        }
    }
    plain
}

/// Truncate URL for error messages
pub(crate) fn truncate_url(url: &str) -> String {
    if url.chars().count() > 80 {
        format!("{}...", url.chars().take(77).collect::<String>())
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_client_creation() {
        assert!(HttpClient::new(&DownloadConfig::default()).is_ok());
    }

    #[test]
    fn test_disposition_filename() {
        assert_eq!(
            disposition_filename(r#"attachment; filename="map.vpk""#).as_deref(),
            Some("map.vpk")
        );
        assert_eq!(
            disposition_filename("attachment; filename=plain.zip").as_deref(),
            Some("plain.zip")
        );
        assert_eq!(
            disposition_filename("attachment; filename=\"x.vpk\"; filename*=UTF-8''%E5%9C%B0%E5%9B%BE.vpk")
                .as_deref(),
            Some("地图.vpk")
        );
        assert_eq!(disposition_filename("inline"), None);
    }

    #[test]
    fn test_truncate_url() {
        let long = format!("https://example.com/{}", "a".repeat(100));
        assert_eq!(truncate_url(&long).chars().count(), 80);
        assert_eq!(truncate_url("https://a.b/c"), "https://a.b/c");
    }
}
