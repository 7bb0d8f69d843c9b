//! The application session
//!
//! [`AppSession`] owns the configuration and, once a root directory is set,
//! a per-root context (catalog, mutator, load order, downloads). Changing the
//! root replaces the whole context. Every method returns [`AppError`].
//!
//! Mutations re-scan the catalog afterwards and broadcast
//! [`SessionEvent::RefreshFiles`]; parse failures found by any scan are
//! batched and broadcast as [`SessionEvent::Errors`].

use crate::catalog::search::{self, SortKey, SortOrder};
use crate::catalog::{Archive, Catalog, ScanReport};
use crate::config::{self, ConfigError, SessionConfig};
use crate::conflict::{self, ConflictReport};
use crate::discover;
use crate::download::{DownloadManager, DownloadSource, DownloadTask, TaskEvent, WorkshopFileDetails};
use crate::error::{AppError, Result};
use crate::ingest;
use crate::layout::{Layout, Location};
use crate::load_order::LoadOrder;
use crate::mutator::{BatchResult, ExportOutcome, Mutator};
use crate::notify::{self, ErrorBatcher, ErrorReport};
use crate::progress::{OperationHandle, Progress};
use crate::rotation::{self, RotationConfig, RotationReport};
use crate::vpk::metadata::PrimaryTag;
use crate::vpk::{preview, ArchiveParser, ParseError, VpkParser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Capacity of the session event channel
const EVENT_CAPACITY: usize = 64;

/// Notifications for the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The catalog changed; reload the file list
    RefreshFiles,
    /// A batch of parse failures
    Errors(ErrorReport),
}

/// Filters and ordering for [`AppSession::search`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub query: String,
    pub primary_tag: String,
    pub secondary_tags: Vec<String>,
    pub location: Option<Location>,
    pub show_hidden: bool,
    pub sort: SortKey,
    pub order: SortOrder,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            primary_tag: String::new(),
            secondary_tags: Vec::new(),
            location: None,
            show_hidden: true,
            sort: SortKey::Name,
            order: SortOrder::Ascending,
        }
    }
}

/// Everything tied to one addons root
struct RootContext {
    layout: Layout,
    catalog: Arc<Catalog>,
    mutator: Mutator,
    load_order: LoadOrder,
    downloads: DownloadManager,
}

/// Channels a scan reports into
#[derive(Clone)]
struct ScanSinks {
    errors: mpsc::UnboundedSender<ParseError>,
    events: broadcast::Sender<SessionEvent>,
}

impl ScanSinks {
    /// Blocking scan that forwards failures and announces the refresh
    fn scan(&self, catalog: &Catalog, progress: Option<&(dyn Fn(usize, usize) + Sync)>) -> Result<ScanReport> {
        let report = catalog.scan(progress)?;
        for error in &report.errors {
            let _ = self.errors.send(error.clone());
        }
        let _ = self.events.send(SessionEvent::RefreshFiles);
        Ok(report)
    }
}

pub struct AppSession {
    config: RwLock<SessionConfig>,
    config_path: Option<PathBuf>,
    parser: Arc<dyn ArchiveParser>,
    context: RwLock<Option<Arc<RootContext>>>,
    sinks: ScanSinks,
}

impl AppSession {
    /// Create a session; must be called inside a tokio runtime.
    ///
    /// A stored root directory is reopened if it still validates.
    pub fn new(config: SessionConfig, config_path: Option<PathBuf>) -> Result<Self> {
        Self::with_parser(config, config_path, Arc::new(VpkParser::default()))
    }

    pub fn with_parser(
        config: SessionConfig,
        config_path: Option<PathBuf>,
        parser: Arc<dyn ArchiveParser>,
    ) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (errors, errors_rx) = mpsc::unbounded_channel();
        let error_events = events.clone();
        tokio::spawn(notify::forward_errors(errors_rx, ErrorBatcher::default(), move |report| {
            warn!("{}", report.message);
            let _ = error_events.send(SessionEvent::Errors(report));
        }));

        let root = config.root_dir.clone();
        let session = Self {
            config: RwLock::new(config),
            config_path,
            parser,
            context: RwLock::new(None),
            sinks: ScanSinks { errors, events },
        };

        if let Some(root) = root {
            match config::validate_directory(&root) {
                Ok(()) => session.open_root(&root)?,
                Err(e) => warn!("Stored root directory unusable: {}", e),
            }
        }
        Ok(session)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sinks.events.subscribe()
    }

    pub fn config(&self) -> SessionConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn context(&self) -> Result<Arc<RootContext>> {
        self.context
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(AppError::Config(ConfigError::RootNotSet))
    }

    fn open_root(&self, root: &Path) -> Result<()> {
        let config = self.config();
        let layout = Layout::new(root, &config.layout);
        let catalog = Arc::new(Catalog::new(layout.clone(), self.parser.clone()));
        let downloads = DownloadManager::new(layout.clone(), config.downloads.clone())?;

        // Finished downloads land in the workshop dir; pick them up
        let hook_catalog = catalog.clone();
        let hook_sinks = self.sinks.clone();
        downloads.set_on_complete(Arc::new(move |task: &DownloadTask| {
            debug!("Rescanning after download {}", task.id);
            let catalog = hook_catalog.clone();
            let sinks = hook_sinks.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = sinks.scan(&catalog, None) {
                    warn!("Rescan after download failed: {}", e);
                }
            });
        }));

        let context = RootContext {
            load_order: LoadOrder::open(LoadOrder::locate(root)),
            mutator: Mutator::new(layout.clone()),
            layout,
            catalog,
            downloads,
        };

        let previous = self
            .context
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .replace(Arc::new(context));
        if let Some(previous) = previous {
            previous.downloads.cancel_all();
        }
        info!("Managing {}", root.display());
        Ok(())
    }

    async fn rescan(&self, context: &Arc<RootContext>) -> Result<ScanReport> {
        let catalog = context.catalog.clone();
        let sinks = self.sinks.clone();
        tokio::task::spawn_blocking(move || sinks.scan(&catalog, None))
            .await
            .map_err(|e| AppError::Task(e.to_string()))?
    }

    // Directory lifecycle

    pub fn validate_directory(&self, path: &Path) -> Result<()> {
        config::validate_directory(path)?;
        Ok(())
    }

    /// Switch to a new addons root and remember it
    pub fn set_root_directory(&self, path: &Path) -> Result<()> {
        config::validate_directory(path)?;
        self.open_root(path)?;

        let config = {
            let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
            config.root_dir = Some(path.to_path_buf());
            config.clone()
        };
        if let Some(config_path) = &self.config_path {
            if let Err(e) = config.save(config_path) {
                warn!("Failed to persist root directory: {:#}", e);
            }
        }
        Ok(())
    }

    pub fn root_directory(&self) -> Option<PathBuf> {
        self.context().ok().map(|c| c.layout.root.clone())
    }

    pub fn auto_discover_addons(&self) -> Option<PathBuf> {
        discover::auto_discover_addons()
    }

    // Scan & query

    pub async fn scan(&self) -> Result<ScanReport> {
        self.scan_with_progress()?.wait().await
    }

    pub fn scan_with_progress(&self) -> Result<OperationHandle<ScanReport>> {
        let context = self.context()?;
        let sinks = self.sinks.clone();
        Ok(OperationHandle::spawn_blocking(move |progress| {
            let report = |current: usize, total: usize| {
                progress.send(Progress::new(current, total, "Scanning archives"));
            };
            sinks.scan(&context.catalog, Some(&report))
        }))
    }

    /// All archives of the last scan, sorted by path
    pub fn files(&self) -> Result<Vec<Archive>> {
        Ok(self.context()?.catalog.snapshot().archives().to_vec())
    }

    pub fn archive(&self, path: &Path) -> Result<Archive> {
        self.context()?
            .catalog
            .snapshot()
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::UnknownArchive(path.display().to_string()))
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<Archive>> {
        let context = self.context()?;
        let snapshot = context.catalog.snapshot();

        let mut archives = search::search(
            snapshot.archives(),
            &query.query,
            &query.primary_tag,
            &query.secondary_tags,
        );
        if let Some(location) = query.location {
            archives = search::filter_location(archives, location);
        }
        archives = search::filter_hidden(archives, query.show_hidden);

        let load_order = match query.sort {
            SortKey::LoadOrder => match context.load_order.get_order() {
                Ok(order) => Some(order),
                Err(e) => {
                    debug!("Load order unavailable for sorting: {}", e);
                    None
                }
            },
            _ => None,
        };
        search::sort_archives(&mut archives, query.sort, query.order, load_order.as_deref());
        Ok(archives)
    }

    pub fn primary_tags(&self) -> Result<Vec<PrimaryTag>> {
        Ok(self.context()?.catalog.snapshot().primary_tags())
    }

    /// Secondary tags under `primary`; empty means all
    pub fn secondary_tags(&self, primary: &str) -> Result<Vec<String>> {
        let snapshot = self.context()?.catalog.snapshot();
        if primary.trim().is_empty() {
            return Ok(snapshot.secondary_tags(None));
        }
        Ok(match PrimaryTag::parse(primary) {
            Some(tag) => snapshot.secondary_tags(Some(tag)),
            None => Vec::new(),
        })
    }

    /// Preview image of a catalogued archive as a `data:` URL
    pub async fn preview_data_url(&self, path: &Path) -> Result<Option<String>> {
        let archive = self.archive(path)?;
        let Some(image) = archive.preview else {
            return Ok(None);
        };
        let url = tokio::task::spawn_blocking(move || preview::load_data_url(&archive.path, &image))
            .await
            .map_err(|e| AppError::Task(e.to_string()))??;
        Ok(Some(url))
    }

    // Mutation

    async fn mutate<T>(&self, op: impl FnOnce(&Mutator) -> crate::mutator::Result<T>) -> Result<T> {
        let context = self.context()?;
        let result = op(&context.mutator)?;
        self.rescan(&context).await?;
        Ok(result)
    }

    async fn mutate_many(&self, op: impl FnOnce(&Mutator) -> BatchResult) -> Result<BatchResult> {
        let context = self.context()?;
        let result = op(&context.mutator);
        self.rescan(&context).await?;
        Ok(result)
    }

    pub async fn toggle(&self, path: &Path) -> Result<PathBuf> {
        self.mutate(|m| m.toggle(path)).await
    }

    pub async fn move_workshop_to_addons(&self, path: &Path) -> Result<PathBuf> {
        self.mutate(|m| m.move_workshop_to_addons(path)).await
    }

    pub async fn delete(&self, path: &Path) -> Result<PathBuf> {
        self.mutate(|m| m.delete(path)).await
    }

    pub async fn rename(&self, path: &Path, new_name: &str) -> Result<PathBuf> {
        self.mutate(|m| m.rename(path, new_name)).await
    }

    pub async fn toggle_visibility(&self, path: &Path) -> Result<PathBuf> {
        self.mutate(|m| m.toggle_visibility(path)).await
    }

    pub async fn set_tags(&self, path: &Path, primary: &str, secondary: &[String]) -> Result<PathBuf> {
        self.mutate(|m| m.set_tags(path, primary, secondary)).await
    }

    pub async fn delete_many(&self, paths: &[PathBuf]) -> Result<BatchResult> {
        self.mutate_many(|m| m.delete_many(paths)).await
    }

    pub async fn enable_many(&self, paths: &[PathBuf]) -> Result<BatchResult> {
        self.mutate_many(|m| m.enable_many(paths)).await
    }

    pub async fn disable_many(&self, paths: &[PathBuf]) -> Result<BatchResult> {
        self.mutate_many(|m| m.disable_many(paths)).await
    }

    pub async fn hide_many(&self, paths: &[PathBuf]) -> Result<BatchResult> {
        self.mutate_many(|m| m.hide_many(paths)).await
    }

    /// Zip the given archives; `None` destination means the user cancelled
    pub fn export_zip(&self, paths: Vec<PathBuf>, dest: Option<PathBuf>) -> Result<OperationHandle<ExportOutcome>> {
        let context = self.context()?;
        Ok(OperationHandle::spawn_blocking(move |progress| {
            let report = |p: Progress| progress.send(p);
            Ok(context
                .mutator
                .export_zip(&paths, dest.as_deref(), Some(&report))?)
        }))
    }

    // Mod rotation

    pub fn mod_rotation(&self) -> RotationConfig {
        self.config().rotation
    }

    /// Store the rotation categories; persisted with the rest of the config
    pub fn set_mod_rotation(&self, rotation: RotationConfig) -> Result<()> {
        let config = {
            let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
            config.rotation = rotation;
            config.clone()
        };
        if let Some(config_path) = &self.config_path {
            config.save(config_path)?;
        }
        Ok(())
    }

    /// Swap in one random archive per rotating tag
    pub async fn rotate_mods(&self) -> Result<RotationReport> {
        let settings = self.mod_rotation();
        if !settings.is_enabled() {
            return Ok(RotationReport::default());
        }
        let context = self.context()?;
        let snapshot = context.catalog.snapshot();
        let report = rotation::rotate(&context.mutator, snapshot.archives(), &settings);
        self.rescan(&context).await?;
        Ok(report)
    }

    // Load order

    pub fn addon_list_order(&self) -> Result<Vec<String>> {
        Ok(self.context()?.load_order.get_order()?)
    }

    pub fn load_order_position(&self, name: &str) -> Result<i64> {
        Ok(self.context()?.load_order.position_of(name)?)
    }

    pub fn set_load_order(&self, name: &str, index: i64) -> Result<i64> {
        Ok(self.context()?.load_order.set_position(name, index)?)
    }

    // Conflicts

    pub fn check_conflicts(&self) -> Result<OperationHandle<ConflictReport>> {
        let context = self.context()?;
        let policy = self.config().conflicts;
        Ok(OperationHandle::spawn_blocking(move |progress| {
            let snapshot = context.catalog.snapshot();
            let report = |p: Progress| progress.send(p);
            Ok(conflict::detect_conflicts(
                snapshot.archives(),
                &context.layout,
                &policy,
                Some(&report),
            ))
        }))
    }

    // Downloads

    pub async fn workshop_details(&self, url: &str) -> Result<WorkshopFileDetails> {
        Ok(self.context()?.downloads.workshop_details(url).await?)
    }

    /// Queue a download; `None` acceleration uses the configured default
    pub fn start_download(&self, source: DownloadSource, use_optimized_ip: Option<bool>) -> Result<DownloadTask> {
        let context = self.context()?;
        let accelerate = use_optimized_ip.unwrap_or(context.downloads.config().use_optimized_ip);
        Ok(context.downloads.start(source, accelerate))
    }

    pub fn download_tasks(&self) -> Result<Vec<DownloadTask>> {
        Ok(self.context()?.downloads.tasks())
    }

    pub fn cancel_download(&self, id: &str) -> Result<DownloadTask> {
        Ok(self.context()?.downloads.cancel(id)?)
    }

    pub fn retry_download(&self, id: &str) -> Result<DownloadTask> {
        Ok(self.context()?.downloads.retry(id)?)
    }

    pub fn clear_completed_downloads(&self) -> Result<usize> {
        Ok(self.context()?.downloads.clear_completed())
    }

    pub fn subscribe_downloads(&self) -> Result<broadcast::Receiver<TaskEvent>> {
        Ok(self.context()?.downloads.subscribe())
    }

    // Ingestion

    /// Install dropped `.vpk`/`.zip`/`.7z`/`.rar` files into the root
    pub async fn handle_file_drop(&self, paths: Vec<PathBuf>) -> Result<BatchResult> {
        let context = self.context()?;
        let root = context.layout.root.clone();
        let result = tokio::task::spawn_blocking(move || ingest::ingest(&paths, &root))
            .await
            .map_err(|e| AppError::Task(e.to_string()))?;
        self.rescan(&context).await?;
        Ok(result)
    }
}
