//! Background download tasks
//!
//! Each task walks `Pending -> [SelectingIp] -> Downloading -> Completed`,
//! or ends in `Failed` / `Cancelled`. Failed and cancelled tasks can be
//! retried. Queued runs wait in a dispatch queue: new tasks join the back,
//! retries jump to the front. A semaphore bounds how many transfers run at
//! once; every state change and throttled progress update is broadcast as a
//! [`TaskEvent`].

pub mod http;
pub mod ip_select;
pub mod workshop;

pub use http::HttpClient;
pub use ip_select::IpSelector;
pub use workshop::{clean_filename, get_workshop_details, parse_workshop_id, WorkshopFileDetails};

use crate::config::DownloadConfig;
use crate::layout::Layout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the task event channel
const EVENT_CAPACITY: usize = 256;

const CANCELLED_MESSAGE: &str = "Cancelled by user";

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Invalid content type: {0}")]
    InvalidContentType(String),

    #[error("Stalled: no data for {0}s")]
    Stalled(u64),

    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,

    #[error("Download URL is empty")]
    EmptyUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to unpack download: {0}")]
    Extract(String),

    #[error("Download task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {id} is {status}")]
    InvalidState { id: String, status: DownloadStatus },

    #[error("Workshop lookup failed: {0}")]
    Workshop(String),

    #[error("Failed to create HTTP client: {0}")]
    Client(String),
}

impl DownloadError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Http(_) | DownloadError::Stalled(_) => true,
            DownloadError::Status { status, .. } => *status != 404,
            _ => false,
        }
    }
}

/// Wrapper that adds retry logic to any async download step
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    max_retries: u32,
    delay: Duration,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, DownloadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
{
    let max_retries = max_retries.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    info!("{} succeeded on attempt {}/{}", operation_name, attempt, max_retries);
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() || attempt >= max_retries => return Err(e),
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_retries, e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    SelectingIp,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::SelectingIp => "selecting_ip",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Pending | DownloadStatus::SelectingIp | DownloadStatus::Downloading
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSource {
    /// `None` for direct links
    pub workshop_id: Option<String>,
    pub title: String,
    pub filename: String,
    pub preview_url: String,
    pub file_url: String,
    /// 0 when unknown
    pub expected_size: u64,
}

impl DownloadSource {
    /// A direct link; the file name comes from the URL path if it has one
    pub fn direct(url: &str) -> Self {
        let filename = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| name.contains('.'))
            .map(|name| clean_filename(&name))
            .unwrap_or_default();

        Self {
            workshop_id: None,
            title: filename.clone(),
            filename,
            preview_url: String::new(),
            file_url: url.to_string(),
            expected_size: 0,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.workshop_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadTask {
    pub id: String,
    pub source: DownloadSource,
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub use_optimized_ip: bool,
    /// Address the transfer was pinned to
    pub ip: Option<String>,
    /// Where the finished file ended up
    pub output: Option<PathBuf>,
}

impl DownloadTask {
    fn new(source: DownloadSource, use_optimized_ip: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            total_bytes: source.expected_size,
            source,
            status: DownloadStatus::Pending,
            downloaded_bytes: 0,
            bytes_per_second: 0.0,
            error: None,
            created_at: Utc::now(),
            use_optimized_ip,
            ip: None,
            output: None,
        }
    }

    /// Percentage complete, 0 when the size is unknown
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        ((self.downloaded_bytes.min(self.total_bytes) * 100) / self.total_bytes) as u8
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "task", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskUpdated(DownloadTask),
    TaskProgress(DownloadTask),
    TasksCleared,
}

/// Called with the finished task after a successful download
pub type CompletionHook = Arc<dyn Fn(&DownloadTask) + Send + Sync>;

struct TaskSlot {
    task: DownloadTask,
    cancel: CancellationToken,
    /// Bumped on retry so a superseded run cannot touch the task
    generation: u64,
}

/// A run waiting for a transfer slot
struct QueuedRun {
    id: String,
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    config: DownloadConfig,
    layout: Layout,
    client: HttpClient,
    ip_selector: IpSelector,
    slots: Arc<Semaphore>,
    queue: Mutex<VecDeque<QueuedRun>>,
    tasks: Mutex<Vec<TaskSlot>>,
    events: broadcast::Sender<TaskEvent>,
    on_complete: Mutex<Option<CompletionHook>>,
}

/// Owns every download task of a session
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(layout: Layout, config: DownloadConfig) -> Result<Self, DownloadError> {
        let client = HttpClient::new(&config)?;
        let ip_selector = IpSelector::new(config.clone(), client.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
                config,
                layout,
                client,
                ip_selector,
                queue: Mutex::new(VecDeque::new()),
                tasks: Mutex::new(Vec::new()),
                events,
                on_complete: Mutex::new(None),
            }),
        })
    }

    pub fn set_on_complete(&self, hook: CompletionHook) {
        *lock(&self.inner.on_complete) = Some(hook);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    pub fn http_client(&self) -> &HttpClient {
        &self.inner.client
    }

    pub fn ip_selector(&self) -> &IpSelector {
        &self.inner.ip_selector
    }

    /// Look up a workshop item with the configured details API
    pub async fn workshop_details(&self, url: &str) -> Result<WorkshopFileDetails, DownloadError> {
        get_workshop_details(self.inner.client.inner(), &self.inner.config.details_api_url, url).await
    }

    /// Queue a download; must be called inside a tokio runtime
    pub fn start(&self, source: DownloadSource, use_optimized_ip: bool) -> DownloadTask {
        let task = DownloadTask::new(source, use_optimized_ip);
        let cancel = CancellationToken::new();

        lock(&self.inner.tasks).push(TaskSlot {
            task: task.clone(),
            cancel: cancel.clone(),
            generation: 0,
        });
        info!("Queued download {} ({})", task.id, task.source.file_url);
        self.inner.emit(TaskEvent::TaskUpdated(task.clone()));

        self.inner.enqueue(
            QueuedRun {
                id: task.id.clone(),
                generation: 0,
                cancel,
            },
            false,
        );
        task
    }

    /// All tasks in creation order
    pub fn tasks(&self) -> Vec<DownloadTask> {
        lock(&self.inner.tasks).iter().map(|s| s.task.clone()).collect()
    }

    pub fn task(&self, id: &str) -> Option<DownloadTask> {
        lock(&self.inner.tasks)
            .iter()
            .find(|s| s.task.id == id)
            .map(|s| s.task.clone())
    }

    pub fn has_active(&self) -> bool {
        lock(&self.inner.tasks).iter().any(|s| s.task.status.is_active())
    }

    /// Cancel a pending or running task
    pub fn cancel(&self, id: &str) -> Result<DownloadTask, DownloadError> {
        let task = {
            let mut tasks = lock(&self.inner.tasks);
            let slot = find_slot(&mut tasks, id)?;
            if !slot.task.status.is_active() {
                return Err(DownloadError::InvalidState {
                    id: id.to_string(),
                    status: slot.task.status,
                });
            }
            slot.cancel.cancel();
            slot.task.status = DownloadStatus::Cancelled;
            slot.task.error = Some(CANCELLED_MESSAGE.to_string());
            slot.task.bytes_per_second = 0.0;
            slot.task.clone()
        };

        info!("Cancelled download {}", id);
        self.inner.emit(TaskEvent::TaskUpdated(task.clone()));
        Ok(task)
    }

    /// Restart a failed or cancelled task from scratch, ahead of queued tasks
    pub fn retry(&self, id: &str) -> Result<DownloadTask, DownloadError> {
        let (task, generation, cancel) = {
            let mut tasks = lock(&self.inner.tasks);
            let slot = find_slot(&mut tasks, id)?;
            if !matches!(slot.task.status, DownloadStatus::Failed | DownloadStatus::Cancelled) {
                return Err(DownloadError::InvalidState {
                    id: id.to_string(),
                    status: slot.task.status,
                });
            }
            slot.generation += 1;
            slot.cancel = CancellationToken::new();
            let task = &mut slot.task;
            task.status = DownloadStatus::Pending;
            task.downloaded_bytes = 0;
            task.total_bytes = task.source.expected_size;
            task.bytes_per_second = 0.0;
            task.error = None;
            task.ip = None;
            task.output = None;
            (task.clone(), slot.generation, slot.cancel.clone())
        };

        info!("Retrying download {}", id);
        self.inner.emit(TaskEvent::TaskUpdated(task.clone()));
        self.inner.enqueue(
            QueuedRun {
                id: id.to_string(),
                generation,
                cancel,
            },
            true,
        );
        Ok(task)
    }

    /// Drop completed, failed and cancelled tasks
    pub fn clear_completed(&self) -> usize {
        let removed = {
            let mut tasks = lock(&self.inner.tasks);
            let before = tasks.len();
            tasks.retain(|s| !s.task.status.is_finished());
            before - tasks.len()
        };
        debug!("Cleared {} finished download(s)", removed);
        self.inner.emit(TaskEvent::TasksCleared);
        removed
    }

    /// Cancel everything still running
    pub fn cancel_all(&self) {
        let ids: Vec<String> = lock(&self.inner.tasks)
            .iter()
            .filter(|s| s.task.status.is_active())
            .map(|s| s.task.id.clone())
            .collect();
        for id in ids {
            let _ = self.cancel(&id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn find_slot<'a>(tasks: &'a mut [TaskSlot], id: &str) -> Result<&'a mut TaskSlot, DownloadError> {
    tasks
        .iter_mut()
        .find(|s| s.task.id == id)
        .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))
}

impl Inner {
    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Apply `f` to the task if this run still owns it
    fn update<R>(&self, id: &str, generation: u64, f: impl FnOnce(&mut DownloadTask) -> R) -> Option<(R, DownloadTask)> {
        let mut tasks = lock(&self.tasks);
        let slot = tasks.iter_mut().find(|s| s.task.id == id)?;
        if slot.generation != generation || slot.task.status == DownloadStatus::Cancelled {
            return None;
        }
        let result = f(&mut slot.task);
        Some((result, slot.task.clone()))
    }

    fn enqueue(self: &Arc<Self>, run: QueuedRun, front: bool) {
        {
            let mut queue = lock(&self.queue);
            if front {
                queue.push_front(run);
            } else {
                queue.push_back(run);
            }
        }
        self.dispatch();
    }

    /// Start queued runs while transfer slots are free
    fn dispatch(self: &Arc<Self>) {
        let mut queue = lock(&self.queue);
        loop {
            // Cancelled or superseded runs never take a slot
            while queue.front().is_some_and(|run| run.cancel.is_cancelled()) {
                queue.pop_front();
            }
            if queue.is_empty() {
                return;
            }
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                return;
            };
            let Some(run) = queue.pop_front() else {
                return;
            };

            let inner = self.clone();
            tokio::spawn(async move {
                inner.clone().run(run.id, run.generation, run.cancel).await;
                drop(permit);
                inner.dispatch();
            });
        }
    }

    fn set_status(&self, id: &str, generation: u64, status: DownloadStatus) -> Option<DownloadTask> {
        let (_, task) = self.update(id, generation, |t| t.status = status)?;
        self.emit(TaskEvent::TaskUpdated(task.clone()));
        Some(task)
    }

    async fn run(self: Arc<Self>, id: String, generation: u64, cancel: CancellationToken) {
        let result = self.execute(&id, generation, &cancel).await;

        match result {
            Ok(task) => {
                info!("Download {} completed: {:?}", id, task.output);
                let hook = lock(&self.on_complete).clone();
                if let Some(hook) = hook {
                    hook(&task);
                }
            }
            Err(e) if cancel.is_cancelled() || matches!(e, DownloadError::Cancelled) => {
                debug!("Download {} stopped: {}", id, e);
            }
            Err(e) => {
                warn!("Download {} failed: {}", id, e);
                let message = e.to_string();
                if let Some((_, task)) = self.update(&id, generation, |t| {
                    t.status = DownloadStatus::Failed;
                    t.error = Some(message);
                    t.bytes_per_second = 0.0;
                }) {
                    self.emit(TaskEvent::TaskUpdated(task));
                }
            }
        }
    }

    async fn execute(
        &self,
        id: &str,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<DownloadTask, DownloadError> {
        let (source, use_optimized_ip) = self
            .update(id, generation, |t| (t.source.clone(), t.use_optimized_ip))
            .map(|(r, _)| r)
            .ok_or(DownloadError::Cancelled)?;

        if source.file_url.trim().is_empty() {
            return Err(DownloadError::EmptyUrl);
        }
        let url = reqwest::Url::parse(source.file_url.trim())
            .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", source.file_url, e)))?;
        let host = url.host_str().unwrap_or_default().to_string();

        let mut client = self.client.clone();
        if use_optimized_ip && self.config.is_cdn_host(&host) {
            self.set_status(id, generation, DownloadStatus::SelectingIp);
            let ip = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                ip = self.ip_selector.best_ip(&url) => ip,
            };
            if let Some(ip) = ip {
                client = self.client.pinned(&host, ip)?;
                self.update(id, generation, |t| t.ip = Some(ip.to_string()));
            }
        }

        self.set_status(id, generation, DownloadStatus::Downloading);

        let temp_dir = &self.layout.temp;
        tokio::fs::create_dir_all(temp_dir)
            .await
            .map_err(|source| DownloadError::Io {
                path: temp_dir.clone(),
                source,
            })?;
        let part = temp_dir.join(format!("{}.part", uuid::Uuid::new_v4().simple()));

        let result = self
            .transfer(id, generation, &client, &url, &source, &part, cancel)
            .await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&part).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial download {}: {}", part.display(), e);
                }
            }
        }
        let (output, bytes) = result?;
        self.complete(id, generation, output, bytes)
    }

    /// Record a finished transfer. A cancel that landed after the file was
    /// moved into place leaves the task cancelled but keeps its output.
    fn complete(&self, id: &str, generation: u64, output: PathBuf, bytes: u64) -> Result<DownloadTask, DownloadError> {
        let (task, cancelled) = {
            let mut tasks = lock(&self.tasks);
            let slot = tasks
                .iter_mut()
                .find(|s| s.task.id == id && s.generation == generation)
                .ok_or(DownloadError::Cancelled)?;
            let task = &mut slot.task;
            let cancelled = task.status == DownloadStatus::Cancelled;
            if !cancelled {
                task.status = DownloadStatus::Completed;
                task.error = None;
            }
            task.downloaded_bytes = bytes;
            task.total_bytes = task.total_bytes.max(bytes);
            task.bytes_per_second = 0.0;
            task.output = Some(output);
            (task.clone(), cancelled)
        };

        self.emit(TaskEvent::TaskUpdated(task.clone()));
        if cancelled {
            info!("Download {} was cancelled after finishing: {:?}", id, task.output);
            return Err(DownloadError::Cancelled);
        }
        Ok(task)
    }

    /// Fetch into `part`, then move (or unpack) it into the workshop dir
    #[allow(clippy::too_many_arguments)]
    async fn transfer(
        &self,
        id: &str,
        generation: u64,
        client: &HttpClient,
        url: &reqwest::Url,
        source: &DownloadSource,
        part: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, u64), DownloadError> {
        let expected = Some(source.expected_size).filter(|s| *s > 0);
        let on_progress = |downloaded: u64, total: u64, speed: f64| {
            if let Some((_, task)) = self.update(id, generation, |t| {
                t.downloaded_bytes = downloaded;
                t.total_bytes = total;
                t.bytes_per_second = speed;
            }) {
                self.emit(TaskEvent::TaskProgress(task));
            }
        };

        let outcome = with_retry("Download", self.config.max_retries, self.config.retry_delay(), cancel, || {
            http::fetch_to_file(client, url.as_str(), part, expected, cancel, &on_progress)
        })
        .await?;

        let filename = self.final_filename(id, generation, source, outcome.suggested_name.as_deref());
        let workshop_dir = self.layout.workshop.clone();
        tokio::fs::create_dir_all(&workshop_dir)
            .await
            .map_err(|source| DownloadError::Io {
                path: workshop_dir.clone(),
                source,
            })?;

        // Last point where a cancel leaves nothing behind
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        if source.is_direct() && filename.to_ascii_lowercase().ends_with(".zip") {
            let output = unpack_zip(part, &filename, workshop_dir).await?;
            return Ok((output, outcome.bytes));
        }

        let target = workshop_dir.join(&filename);
        tokio::fs::rename(part, &target)
            .await
            .map_err(|source| DownloadError::Io {
                path: target.clone(),
                source,
            })?;
        Ok((target, outcome.bytes))
    }

    /// Decide the output name, recording it on the task when it changes
    fn final_filename(
        &self,
        id: &str,
        generation: u64,
        source: &DownloadSource,
        suggested: Option<&str>,
    ) -> String {
        let mut filename = clean_filename(&source.filename);
        let generic = filename.is_empty() || filename.to_ascii_lowercase().starts_with("unknown");

        if let Some(suggested) = suggested.map(clean_filename).filter(|s| !s.is_empty()) {
            if source.is_direct() || generic {
                filename = suggested;
            }
        }
        if filename.is_empty() || filename.eq_ignore_ascii_case("unknown.vpk") {
            filename = format!("unknown_{}.vpk", Utc::now().timestamp());
        }

        if filename != source.filename {
            let name = filename.clone();
            if let Some((_, task)) = self.update(id, generation, |t| {
                if t.source.is_direct() {
                    t.source.title = name.clone();
                }
                t.source.filename = name;
            }) {
                self.emit(TaskEvent::TaskUpdated(task));
            }
        }
        filename
    }
}

/// Extract the VPKs of a downloaded zip into `dest`, then drop the zip
async fn unpack_zip(part: &std::path::Path, filename: &str, dest: PathBuf) -> Result<PathBuf, DownloadError> {
    let zip_path = part.with_extension("zip");
    tokio::fs::rename(part, &zip_path)
        .await
        .map_err(|source| DownloadError::Io {
            path: zip_path.clone(),
            source,
        })?;

    let archive = zip_path.clone();
    let extracted = tokio::task::spawn_blocking(move || crate::ingest::extract_vpks(&archive, &dest))
        .await
        .map_err(|e| DownloadError::Extract(e.to_string()))?;
    let _ = tokio::fs::remove_file(&zip_path).await;

    let extracted = extracted.map_err(|e| DownloadError::Extract(format!("{}: {:#}", filename, e)))?;
    info!("Unpacked {} archive(s) from {}", extracted.len(), filename);
    extracted
        .into_iter()
        .next()
        .ok_or_else(|| DownloadError::Extract(format!("{}: no VPK files", filename)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Clone)]
    enum Reply {
        Body {
            content_type: &'static str,
            disposition: Option<&'static str>,
            body: Vec<u8>,
        },
        NotFound,
        /// Headers and a first chunk, then nothing
        Hang,
    }

    /// Minimal HTTP/1.1 responder; returns its address and a hit counter
    async fn serve(reply: Reply) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut request = Vec::new();
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    match reply {
                        Reply::Body {
                            content_type,
                            disposition,
                            body,
                        } => {
                            let mut head = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                                content_type,
                                body.len()
                            );
                            if let Some(d) = disposition {
                                head.push_str(&format!("Content-Disposition: {}\r\n", d));
                            }
                            head.push_str("\r\n");
                            let _ = socket.write_all(head.as_bytes()).await;
                            let _ = socket.write_all(&body).await;
                        }
                        Reply::NotFound => {
                            let _ = socket
                                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                                .await;
                        }
                        Reply::Hang => {
                            let _ = socket
                                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: 1000000\r\n\r\n")
                                .await;
                            let _ = socket.write_all(&[0u8; 1024]).await;
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{}", addr), hits)
    }

    fn manager(root: &std::path::Path) -> DownloadManager {
        let layout = Layout::new(root, &LayoutConfig::default());
        let config = DownloadConfig {
            use_system_proxy: false,
            retry_delay_ms: 10,
            ..DownloadConfig::default()
        };
        DownloadManager::new(layout, config).unwrap()
    }

    fn source(url: String, filename: &str) -> DownloadSource {
        DownloadSource {
            workshop_id: Some("42".to_string()),
            title: "Test".to_string(),
            filename: filename.to_string(),
            file_url: url,
            ..DownloadSource::default()
        }
    }

    /// Statuses from `TaskUpdated` events until the task finishes
    async fn statuses_until_done(rx: &mut broadcast::Receiver<TaskEvent>, id: &str) -> Vec<DownloadStatus> {
        let mut seen = Vec::new();
        let collect = async {
            loop {
                match rx.recv().await {
                    Ok(TaskEvent::TaskUpdated(task)) if task.id == id => {
                        if seen.last() != Some(&task.status) {
                            seen.push(task.status);
                        }
                        if task.status.is_finished() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), collect).await.unwrap();
        seen
    }

    #[tokio::test]
    async fn test_direct_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _) = serve(Reply::Body {
            content_type: "application/octet-stream",
            disposition: None,
            body: b"VPKDATA".to_vec(),
        })
        .await;

        let downloads = manager(dir.path());
        let mut rx = downloads.subscribe();
        // Acceleration requested, but the host is not a CDN host
        let task = downloads.start(source(format!("{}/files/skin.vpk", base), "skin.vpk"), true);

        let statuses = statuses_until_done(&mut rx, &task.id).await;
        assert_eq!(
            statuses,
            vec![DownloadStatus::Pending, DownloadStatus::Downloading, DownloadStatus::Completed]
        );

        let done = downloads.task(&task.id).unwrap();
        let output = dir.path().join("workshop").join("skin.vpk");
        assert_eq!(done.output.as_deref(), Some(output.as_path()));
        assert_eq!(done.downloaded_bytes, 7);
        assert_eq!(std::fs::read(&output).unwrap(), b"VPKDATA");
        assert_eq!(std::fs::read_dir(dir.path().join("temp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (base, hits) = serve(Reply::NotFound).await;

        let downloads = manager(dir.path());
        let mut rx = downloads.subscribe();
        let task = downloads.start(source(format!("{}/missing.vpk", base), "missing.vpk"), false);

        let statuses = statuses_until_done(&mut rx, &task.id).await;
        assert_eq!(statuses.last(), Some(&DownloadStatus::Failed));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let failed = downloads.task(&task.id).unwrap();
        assert!(failed.error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_html_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _) = serve(Reply::Body {
            content_type: "text/html; charset=utf-8",
            disposition: None,
            body: b"<html></html>".to_vec(),
        })
        .await;

        let downloads = manager(dir.path());
        let mut rx = downloads.subscribe();
        let task = downloads.start(source(format!("{}/page", base), "page.vpk"), false);
        statuses_until_done(&mut rx, &task.id).await;

        let failed = downloads.task(&task.id).unwrap();
        assert_eq!(failed.status, DownloadStatus::Failed);
        assert!(failed.error.unwrap().contains("Invalid content type: text/html"));
        assert!(!dir.path().join("workshop").join("page.vpk").exists());
    }

    #[tokio::test]
    async fn test_direct_filename_from_disposition() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _) = serve(Reply::Body {
            content_type: "application/octet-stream",
            disposition: Some("attachment; filename=\"served.vpk\""),
            body: b"abc".to_vec(),
        })
        .await;

        let downloads = manager(dir.path());
        let mut rx = downloads.subscribe();
        let task = downloads.start(DownloadSource::direct(&format!("{}/get?id=1", base)), false);
        statuses_until_done(&mut rx, &task.id).await;

        let done = downloads.task(&task.id).unwrap();
        assert_eq!(done.status, DownloadStatus::Completed);
        assert_eq!(done.source.filename, "served.vpk");
        assert_eq!(done.source.title, "served.vpk");
        assert!(dir.path().join("workshop").join("served.vpk").exists());
    }

    #[tokio::test]
    async fn test_direct_zip_is_unpacked() {
        let dir = tempfile::tempdir().unwrap();
        let mut zip_bytes = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("inner/pack.vpk", options).unwrap();
            zip.write_all(b"vpk").unwrap();
            zip.finish().unwrap();
        }
        let (base, _) = serve(Reply::Body {
            content_type: "application/zip",
            disposition: None,
            body: zip_bytes,
        })
        .await;

        let downloads = manager(dir.path());
        let mut rx = downloads.subscribe();
        let task = downloads.start(DownloadSource::direct(&format!("{}/bundle.zip", base)), false);
        statuses_until_done(&mut rx, &task.id).await;

        let done = downloads.task(&task.id).unwrap();
        assert_eq!(done.status, DownloadStatus::Completed, "{:?}", done.error);
        let workshop = dir.path().join("workshop");
        assert_eq!(done.output, Some(workshop.join("pack.vpk")));
        assert!(!workshop.join("bundle.zip").exists());
    }

    #[tokio::test]
    async fn test_cancel_then_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _) = serve(Reply::Hang).await;

        let downloads = manager(dir.path());
        let mut rx = downloads.subscribe();
        let task = downloads.start(source(format!("{}/slow.vpk", base), "slow.vpk"), false);

        // Wait until bytes are flowing
        let started = async {
            loop {
                if let Ok(TaskEvent::TaskUpdated(t)) = rx.recv().await {
                    if t.id == task.id && t.status == DownloadStatus::Downloading {
                        break;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), started).await.unwrap();

        let cancelled = downloads.cancel(&task.id).unwrap();
        assert_eq!(cancelled.status, DownloadStatus::Cancelled);
        assert!(downloads.cancel(&task.id).is_err());

        // Partial output is removed once the transfer notices
        let temp = dir.path().join("temp");
        let cleaned = async {
            while std::fs::read_dir(&temp).map(|d| d.count()).unwrap_or(0) > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), cleaned).await.unwrap();
        assert_eq!(downloads.task(&task.id).unwrap().status, DownloadStatus::Cancelled);

        let retried = downloads.retry(&task.id).unwrap();
        assert_eq!(retried.status, DownloadStatus::Pending);
        assert_eq!(retried.downloaded_bytes, 0);
        assert!(retried.error.is_none());

        downloads.cancel_all();
    }

    #[tokio::test]
    async fn test_clear_completed_keeps_active() {
        let dir = tempfile::tempdir().unwrap();
        let (done_base, _) = serve(Reply::Body {
            content_type: "application/octet-stream",
            disposition: None,
            body: b"x".to_vec(),
        })
        .await;
        let (slow_base, _) = serve(Reply::Hang).await;

        let downloads = manager(dir.path());
        let mut rx = downloads.subscribe();
        let finished = downloads.start(source(format!("{}/a.vpk", done_base), "a.vpk"), false);
        statuses_until_done(&mut rx, &finished.id).await;
        let active = downloads.start(source(format!("{}/b.vpk", slow_base), "b.vpk"), false);

        assert_eq!(downloads.clear_completed(), 1);
        let remaining: Vec<_> = downloads.tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(remaining, vec![active.id.clone()]);

        downloads.cancel_all();
    }

    #[tokio::test]
    async fn test_retry_runs_before_queued_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let (slow_base, _) = serve(Reply::Hang).await;
        let (fast_base, _) = serve(Reply::Body {
            content_type: "application/octet-stream",
            disposition: None,
            body: b"vpk".to_vec(),
        })
        .await;

        let layout = Layout::new(dir.path(), &LayoutConfig::default());
        let config = DownloadConfig {
            use_system_proxy: false,
            retry_delay_ms: 10,
            max_concurrent: 1,
            ..DownloadConfig::default()
        };
        let downloads = DownloadManager::new(layout, config).unwrap();
        let mut rx = downloads.subscribe();

        // The only slot is busy with a transfer that never ends
        let blocker = downloads.start(source(format!("{}/slow.vpk", slow_base), "slow.vpk"), false);
        let busy = async {
            loop {
                if let Ok(TaskEvent::TaskUpdated(t)) = rx.recv().await {
                    if t.id == blocker.id && t.status == DownloadStatus::Downloading {
                        break;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), busy).await.unwrap();

        let first = downloads.start(source(format!("{}/first.vpk", fast_base), "first.vpk"), false);
        let second = downloads.start(source(format!("{}/second.vpk", fast_base), "second.vpk"), false);
        let retried = downloads.start(source(format!("{}/retried.vpk", fast_base), "retried.vpk"), false);
        downloads.cancel(&retried.id).unwrap();
        downloads.retry(&retried.id).unwrap();
        assert_eq!(downloads.task(&first.id).unwrap().status, DownloadStatus::Pending);

        downloads.cancel(&blocker.id).unwrap();

        let waiting = [first.id.clone(), second.id.clone(), retried.id.clone()];
        let mut started = Vec::new();
        let mut finished = 0;
        let collect = async {
            while finished < waiting.len() {
                match rx.recv().await {
                    Ok(TaskEvent::TaskUpdated(t)) if waiting.contains(&t.id) => {
                        if t.status == DownloadStatus::Downloading && !started.contains(&t.id) {
                            started.push(t.id.clone());
                        }
                        if t.status == DownloadStatus::Completed {
                            finished += 1;
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), collect).await.unwrap();

        assert_eq!(started, vec![retried.id.clone(), first.id.clone(), second.id.clone()]);
        assert!(dir.path().join("workshop").join("retried.vpk").exists());
    }

    #[tokio::test]
    async fn test_cancel_after_move_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path());
        let output = dir.path().join("workshop").join("late.vpk");

        let mut cancelled = DownloadTask::new(source("http://127.0.0.1/late.vpk".to_string(), "late.vpk"), false);
        cancelled.status = DownloadStatus::Cancelled;
        let mut running = DownloadTask::new(source("http://127.0.0.1/ok.vpk".to_string(), "ok.vpk"), false);
        running.status = DownloadStatus::Downloading;
        for task in [cancelled.clone(), running.clone()] {
            lock(&downloads.inner.tasks).push(TaskSlot {
                task,
                cancel: CancellationToken::new(),
                generation: 0,
            });
        }

        let result = downloads.inner.complete(&cancelled.id, 0, output.clone(), 5);
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        let kept = downloads.task(&cancelled.id).unwrap();
        assert_eq!(kept.status, DownloadStatus::Cancelled);
        assert_eq!(kept.output.as_deref(), Some(output.as_path()));
        assert_eq!(kept.downloaded_bytes, 5);

        // A stale generation records nothing
        assert!(downloads.inner.complete(&running.id, 1, output.clone(), 5).is_err());
        assert!(downloads.task(&running.id).unwrap().output.is_none());

        let done = downloads.inner.complete(&running.id, 0, output.clone(), 5).unwrap();
        assert_eq!(done.status, DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path());
        assert!(matches!(downloads.cancel("nope"), Err(DownloadError::TaskNotFound(_))));
        assert!(matches!(downloads.retry("nope"), Err(DownloadError::TaskNotFound(_))));
    }

    #[test]
    fn test_direct_source_filename() {
        let s = DownloadSource::direct("https://example.com/dl/myl4d2addons_map.vpk?x=1");
        assert_eq!(s.filename, "map.vpk");
        assert!(s.is_direct());
        assert_eq!(DownloadSource::direct("https://example.com/get").filename, "");
    }

    #[test]
    fn test_retryable() {
        assert!(!DownloadError::Status { status: 404, url: String::new() }.is_retryable());
        assert!(DownloadError::Status { status: 503, url: String::new() }.is_retryable());
        assert!(!DownloadError::Cancelled.is_retryable());
        assert!(!DownloadError::InvalidContentType("text/html".into()).is_retryable());
    }
}
