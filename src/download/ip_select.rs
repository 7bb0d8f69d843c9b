//! CDN edge selection for accelerated downloads
//!
//! Candidates (configured addresses plus the host's own DNS answers) are
//! raced with TCP connects; the lowest latency responder wins. Selection runs
//! once per host per session: concurrent callers share the in-flight race.

use super::http::HttpClient;
use crate::config::DownloadConfig;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Finalists that get a throughput check when it is enabled
const SPEED_TEST_FINALISTS: usize = 3;

type Selection = Arc<OnceCell<Option<IpAddr>>>;

pub struct IpSelector {
    config: DownloadConfig,
    client: HttpClient,
    cache: Mutex<HashMap<String, Selection>>,
    selections: AtomicUsize,
}

impl IpSelector {
    pub fn new(config: DownloadConfig, client: HttpClient) -> Self {
        Self {
            config,
            client,
            cache: Mutex::new(HashMap::new()),
            selections: AtomicUsize::new(0),
        }
    }

    /// Best address for the host of `url`, `None` to use normal DNS
    pub async fn best_ip(&self, url: &reqwest::Url) -> Option<IpAddr> {
        let host = url.host_str()?.to_ascii_lowercase();
        let cell = {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            cache.entry(host.clone()).or_default().clone()
        };
        *cell.get_or_init(|| self.select(&host, url)).await
    }

    /// Result of a finished selection, without starting one
    pub fn cached(&self, host: &str) -> Option<IpAddr> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .get(&host.to_ascii_lowercase())
            .and_then(|cell| cell.get().copied().flatten())
    }

    /// Number of selection races run so far
    pub fn selections(&self) -> usize {
        self.selections.load(Ordering::Relaxed)
    }

    async fn select(&self, host: &str, url: &reqwest::Url) -> Option<IpAddr> {
        self.selections.fetch_add(1, Ordering::Relaxed);

        let candidates = self.candidates(host).await;
        info!("Racing {} candidate address(es) for {}", candidates.len(), host);

        let ranked = self.probe_all(&candidates).await;
        if ranked.is_empty() {
            warn!("No candidate for {} answered, using default DNS", host);
            return None;
        }
        for (ip, latency) in &ranked {
            debug!("{} answered in {:?}", ip, latency);
        }

        if self.config.speed_test_bytes > 0 {
            if let Some(ip) = self.fastest_transfer(host, url, &ranked).await {
                info!("Selected {} for {} by throughput", ip, host);
                return Some(ip);
            }
        }

        let (ip, latency) = ranked[0];
        info!("Selected {} for {} ({:?})", ip, host, latency);
        Some(ip)
    }

    async fn candidates(&self, host: &str) -> Vec<IpAddr> {
        let mut candidates: Vec<IpAddr> = self
            .config
            .candidate_ips
            .iter()
            .filter_map(|ip| match ip.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("Ignoring invalid candidate address '{}'", ip);
                    None
                }
            })
            .collect();

        let lookup = tokio::net::lookup_host((host, self.config.probe_port));
        match tokio::time::timeout(self.config.probe_timeout(), lookup).await {
            Ok(Ok(addrs)) => candidates.extend(addrs.map(|a| a.ip())),
            Ok(Err(e)) => debug!("DNS lookup for {} failed: {}", host, e),
            Err(_) => debug!("DNS lookup for {} timed out", host),
        }

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|ip| seen.insert(*ip));
        candidates
    }

    /// TCP connect to every candidate; responders sorted by latency
    async fn probe_all(&self, candidates: &[IpAddr]) -> Vec<(IpAddr, Duration)> {
        let port = self.config.probe_port;
        let probe_timeout = self.config.probe_timeout();

        let mut probes: FuturesUnordered<_> = candidates
            .iter()
            .map(|&ip| async move {
                let start = Instant::now();
                let connect = TcpStream::connect(SocketAddr::new(ip, port));
                match tokio::time::timeout(probe_timeout, connect).await {
                    Ok(Ok(_)) => Some((ip, start.elapsed())),
                    _ => None,
                }
            })
            .collect();

        let mut ranked = Vec::new();
        let deadline = tokio::time::sleep(self.config.selection_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("Selection window closed with {} responder(s)", ranked.len());
                    break;
                }
                next = probes.next() => match next {
                    Some(Some(result)) => ranked.push(result),
                    Some(None) => {}
                    None => break,
                },
            }
        }

        ranked.sort_by_key(|(_, latency)| *latency);
        ranked
    }

    /// Range-fetch the head of `url` through each finalist, fastest wins
    async fn fastest_transfer(
        &self,
        host: &str,
        url: &reqwest::Url,
        ranked: &[(IpAddr, Duration)],
    ) -> Option<IpAddr> {
        let bytes = self.config.speed_test_bytes;
        let tests = ranked.iter().take(SPEED_TEST_FINALISTS).map(|&(ip, _)| async move {
            let client = self.client.pinned(host, ip).ok()?;
            let start = Instant::now();
            let response = client
                .inner()
                .get(url.clone())
                .header(reqwest::header::RANGE, format!("bytes=0-{}", bytes - 1))
                .send()
                .await
                .ok()?;
            if !response.status().is_success() {
                return None;
            }
            let body = response.bytes().await.ok()?;
            let speed = body.len() as f64 / start.elapsed().as_secs_f64().max(0.001);
            debug!("{} transferred at {:.0} B/s", ip, speed);
            Some((ip, speed))
        });

        let results = tokio::time::timeout(
            self.config.speed_test_timeout(),
            futures::future::join_all(tests),
        )
        .await
        .ok()?;

        results
            .into_iter()
            .flatten()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(ip, _)| ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn selector(port: u16) -> IpSelector {
        let config = DownloadConfig {
            candidate_ips: vec!["127.0.0.1".to_string(), "not-an-ip".to_string()],
            probe_port: port,
            use_system_proxy: false,
            ..DownloadConfig::default()
        };
        let client = HttpClient::new(&config).unwrap();
        IpSelector::new(config, client)
    }

    #[tokio::test]
    async fn test_single_flight_per_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let selector = Arc::new(selector(port));
        let url = reqwest::Url::parse(&format!("http://localhost:{}/file.vpk", port)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let selector = selector.clone();
            let url = url.clone();
            handles.push(tokio::spawn(async move { selector.best_ip(&url).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some("127.0.0.1".parse().unwrap()));
        }

        assert_eq!(selector.selections(), 1);
        assert_eq!(selector.cached("LOCALHOST"), Some("127.0.0.1".parse().unwrap()));
        drop(listener);
    }

    #[tokio::test]
    async fn test_no_responder_falls_back() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let selector = selector(port);
        let url = reqwest::Url::parse(&format!("http://localhost:{}/file.vpk", port)).unwrap();

        assert_eq!(selector.best_ip(&url).await, None);
        // Fallback is cached too
        assert_eq!(selector.best_ip(&url).await, None);
        assert_eq!(selector.selections(), 1);
    }
}
