//! vpkhub - Left 4 Dead 2 addon manager
//!
//! Command-line front end over [`vpkhub::AppSession`].

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};
use vpkhub::catalog::search::{SortKey, SortOrder};
use vpkhub::catalog::Archive;
use vpkhub::config::SessionConfig;
use vpkhub::download::{DownloadSource, DownloadStatus, TaskEvent};
use vpkhub::layout::Location;
use vpkhub::mutator::{BatchResult, ExportOutcome};
use vpkhub::progress::{OperationHandle, Progress};
use vpkhub::session::SearchQuery;
use vpkhub::AppSession;

#[derive(Parser)]
#[command(name = "vpkhub")]
#[command(version)]
#[command(about = "Manage Left 4 Dead 2 VPK addons")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Addons directory (defaults to the stored one, then auto-discovery)
    #[arg(short, long, global = true, env = "VPKHUB_ROOT")]
    root: Option<PathBuf>,

    /// Configuration file
    #[arg(long, global = true, env = "VPKHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write JSON logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the addons directory
    Scan,

    /// List archives
    List {
        #[arg(short, long)]
        location: Option<LocationArg>,

        /// Leave out hidden archives
        #[arg(long)]
        no_hidden: bool,

        #[arg(short, long, value_enum, default_value = "name")]
        sort: SortArg,

        /// Reverse the order (ignored for load-order sorting)
        #[arg(long)]
        desc: bool,
    },

    /// Search by text and tags
    Search {
        #[arg(default_value = "")]
        query: String,

        /// Primary tag (map, character, weapon, other)
        #[arg(short, long, default_value = "")]
        primary: String,

        /// Secondary tags; any of them matches
        #[arg(short = 't', long = "tag")]
        secondary: Vec<String>,
    },

    /// Show the tag vocabulary
    Tags {
        /// Only secondary tags under this primary tag
        primary: Option<String>,
    },

    /// Find archives that overwrite each other's files
    Conflicts {
        /// Also print every conflicting path
        #[arg(long)]
        paths: bool,
    },

    /// Read or change addonlist.txt
    Order {
        #[command(subcommand)]
        action: OrderAction,
    },

    /// Move archives between the addons root and the disabled directory
    Toggle {
        #[arg(required = true)]
        files: Vec<String>,

        /// Enable all of them
        #[arg(long, conflicts_with = "off")]
        on: bool,

        /// Disable all of them
        #[arg(long)]
        off: bool,
    },

    /// Move workshop archives into the addons root
    Adopt {
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Hide archives (or flip visibility with --toggle)
    Hide {
        #[arg(required = true)]
        files: Vec<String>,

        #[arg(long)]
        toggle: bool,
    },

    /// Rename an archive, keeping its tag block
    Rename { file: String, new_name: String },

    /// Set the filename tags of an archive
    Tag {
        file: String,
        primary: String,
        secondary: Vec<String>,
    },

    /// Move archives to the trash directory
    Delete {
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Bundle archives into a zip
    Export {
        dest: PathBuf,
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Enable one random archive per character/weapon tag in use
    Rotate {
        /// Rotate character skins (true/false); stored for later runs
        #[arg(long)]
        characters: Option<bool>,

        /// Rotate weapon skins (true/false); stored for later runs
        #[arg(long)]
        weapons: Option<bool>,

        /// Only print the stored settings
        #[arg(long)]
        show: bool,
    },

    /// Install .vpk files or the VPKs inside .zip/.7z/.rar archives
    Install {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show workshop item details
    Workshop { url: String },

    /// Download a workshop item (or a direct link with --direct)
    Download {
        url: String,

        #[arg(long)]
        direct: bool,

        /// Race CDN addresses before downloading
        #[arg(long)]
        fast: bool,
    },

    /// Parse a single VPK and print what was found
    Inspect {
        file: PathBuf,

        /// Print the internal file listing
        #[arg(long)]
        files: bool,
    },
}

#[derive(Subcommand)]
enum OrderAction {
    /// Print the load order
    Get,
    /// Move an archive to a 1-based position
    Set { name: String, index: i64 },
    /// Print the position of an archive (-1 if absent)
    Pos { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Name,
    Modified,
    LoadOrder,
}

impl From<SortArg> for SortKey {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Name => SortKey::Name,
            SortArg::Modified => SortKey::Modified,
            SortArg::LoadOrder => SortKey::LoadOrder,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LocationArg {
    Root,
    Disabled,
    Workshop,
}

impl From<LocationArg> for Location {
    fn from(arg: LocationArg) -> Self {
        match arg {
            LocationArg::Root => Location::Root,
            LocationArg::Disabled => Location::Disabled,
            LocationArg::Workshop => Location::Workshop,
        }
    }
}

fn progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | {msg}")?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

/// Drain an operation's progress into a bar, then return its result
async fn with_bar<T: Send + 'static>(mut handle: OperationHandle<T>) -> Result<T> {
    let pb = progress_bar()?;
    while let Some(Progress {
        current,
        total,
        message,
    }) = handle.next_progress().await
    {
        pb.set_length(total as u64);
        pb.set_position(current as u64);
        pb.set_message(message);
    }
    pb.finish_and_clear();
    Ok(handle.wait().await?)
}

/// Accept a path or an archive name from the catalog
fn resolve(session: &AppSession, file: &str) -> Result<PathBuf> {
    let path = Path::new(file);
    if path.is_file() {
        return Ok(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()));
    }
    session
        .files()?
        .into_iter()
        .find(|a| a.name.eq_ignore_ascii_case(file) || a.path.ends_with(file))
        .map(|a| a.path)
        .with_context(|| format!("No archive named '{}'", file))
}

fn resolve_all(session: &AppSession, files: &[String]) -> Result<Vec<PathBuf>> {
    files.iter().map(|f| resolve(session, f)).collect()
}

fn print_batch(action: &str, result: &BatchResult) {
    println!("{}: {} succeeded, {} failed", action, result.success, result.failed);
    for error in &result.errors {
        println!("  {}", error);
    }
}

fn print_archives(archives: &[Archive]) {
    for a in archives {
        let state = match a.location {
            Location::Root => "on ",
            Location::Disabled => "off",
            Location::Workshop => "ws ",
        };
        let tag = a
            .metadata
            .primary_tag()
            .map(|t| t.as_str())
            .unwrap_or("-");
        let secondary = a.metadata.secondary_tags().join(",");
        let title = if a.parse_error.is_some() {
            "(unreadable)"
        } else {
            a.title()
        };
        println!(
            "{} {:<10} {:<40} {} [{}]{}",
            state,
            tag,
            a.name,
            title,
            secondary,
            if a.hidden { " (hidden)" } else { "" }
        );
    }
    eprintln!("\nTotal: {} archives", archives.len());
}

fn log_filter(verbose: bool) -> Result<EnvFilter> {
    Ok(EnvFilter::from_default_env()
        .add_directive(if verbose { "vpkhub=debug".parse()? } else { "vpkhub=warn".parse()? }))
}

/// Console logging only if verbose or RUST_LOG is set; a log file always records vpkhub at debug
fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let console = (cli.verbose || std::env::var("RUST_LOG").is_ok())
        .then(|| log_filter(cli.verbose).map(|filter| fmt::layer().with_writer(std::io::stderr).with_filter(filter)))
        .transpose()?;

    let (file, guard) = match &cli.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(log_filter(true)?);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(console).with(file).init();
    Ok(guard)
}

async fn open_session(cli: &Cli) -> Result<AppSession> {
    let config_path = cli.config.clone().or_else(SessionConfig::default_path);
    let config = match &config_path {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    let session = AppSession::new(config, config_path)?;

    let root = match &cli.root {
        Some(root) => Some(root.clone()),
        None if session.root_directory().is_some() => None,
        None => session.auto_discover_addons(),
    };
    if let Some(root) = root {
        session.set_root_directory(&root)?;
    }
    if session.root_directory().is_none() {
        bail!("No addons directory found; pass --root");
    }
    Ok(session)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(&cli)?;

    if let Commands::Inspect { file, files } = &cli.command {
        let parsed = vpkhub::vpk::parse(file)?;
        println!("{}", serde_json::to_string_pretty(&parsed.metadata)?);
        println!("Entries: {}", parsed.listing.len());
        if let Some(preview) = &parsed.embedded_preview {
            println!("Preview: {}", preview);
        }
        if *files {
            for entry in &parsed.listing {
                println!("  {}", entry);
            }
        }
        return Ok(());
    }

    let session = open_session(&cli).await?;
    let report = with_bar(session.scan_with_progress()?).await?;
    for error in &report.errors {
        eprintln!("warning: {}", error);
    }

    match cli.command {
        Commands::Inspect { .. } => unreachable!("handled before the session opens"),

        Commands::Scan => {
            println!(
                "Scanned {}: {} archives ({} parsed, {} cached, {} failed)",
                session.root_directory().unwrap_or_default().display(),
                report.total,
                report.parsed,
                report.cached,
                report.errors.len()
            );
        }

        Commands::List {
            location,
            no_hidden,
            sort,
            desc,
        } => {
            let query = SearchQuery {
                location: location.map(Location::from),
                show_hidden: !no_hidden,
                sort: sort.into(),
                order: if desc { SortOrder::Descending } else { SortOrder::Ascending },
                ..SearchQuery::default()
            };
            print_archives(&session.search(&query)?);
        }

        Commands::Search {
            query,
            primary,
            secondary,
        } => {
            let query = SearchQuery {
                query,
                primary_tag: primary,
                secondary_tags: secondary,
                ..SearchQuery::default()
            };
            print_archives(&session.search(&query)?);
        }

        Commands::Tags { primary } => match primary {
            Some(primary) => {
                for tag in session.secondary_tags(&primary)? {
                    println!("{}", tag);
                }
            }
            None => {
                for tag in session.primary_tags()? {
                    println!("{}:", tag);
                    for secondary in session.secondary_tags(tag.as_str())? {
                        println!("  {}", secondary);
                    }
                }
            }
        },

        Commands::Conflicts { paths } => {
            let report = with_bar(session.check_conflicts()?).await?;
            if report.groups.is_empty() {
                println!("No conflicts found");
            }
            for group in &report.groups {
                println!(
                    "[{:?}] {} ({} paths)",
                    group.severity,
                    group.archives.join(" <-> "),
                    group.paths.len()
                );
                if paths {
                    for p in &group.paths {
                        println!("    {:?}  {}", p.severity, p.path);
                    }
                }
            }
            eprintln!("\nTotal: {} conflict groups", report.total);
        }

        Commands::Order { action } => match action {
            OrderAction::Get => {
                for (i, name) in session.addon_list_order()?.iter().enumerate() {
                    println!("{:>4}  {}", i + 1, name);
                }
            }
            OrderAction::Set { name, index } => {
                let position = session.set_load_order(&name, index)?;
                println!("{} -> {}", name, position);
            }
            OrderAction::Pos { name } => {
                println!("{}", session.load_order_position(&name)?);
            }
        },

        Commands::Toggle { files, on, off } => {
            let paths = resolve_all(&session, &files)?;
            if on {
                print_batch("Enable", &session.enable_many(&paths).await?);
            } else if off {
                print_batch("Disable", &session.disable_many(&paths).await?);
            } else {
                for path in paths {
                    let moved = session.toggle(&path).await?;
                    println!("{} -> {}", path.display(), moved.display());
                }
            }
        }

        Commands::Adopt { files } => {
            for path in resolve_all(&session, &files)? {
                let moved = session.move_workshop_to_addons(&path).await?;
                println!("{} -> {}", path.display(), moved.display());
            }
        }

        Commands::Hide { files, toggle } => {
            let paths = resolve_all(&session, &files)?;
            if toggle {
                for path in paths {
                    let moved = session.toggle_visibility(&path).await?;
                    println!("{} -> {}", path.display(), moved.display());
                }
            } else {
                print_batch("Hide", &session.hide_many(&paths).await?);
            }
        }

        Commands::Rename { file, new_name } => {
            let path = resolve(&session, &file)?;
            let renamed = session.rename(&path, &new_name).await?;
            println!("{} -> {}", path.display(), renamed.display());
        }

        Commands::Tag {
            file,
            primary,
            secondary,
        } => {
            let path = resolve(&session, &file)?;
            let renamed = session.set_tags(&path, &primary, &secondary).await?;
            println!("{} -> {}", path.display(), renamed.display());
        }

        Commands::Delete { files } => {
            let paths = resolve_all(&session, &files)?;
            if let [single] = paths.as_slice() {
                let trashed = session.delete(single).await?;
                println!("Moved to {}", trashed.display());
            } else {
                print_batch("Delete", &session.delete_many(&paths).await?);
            }
        }

        Commands::Export { dest, files } => {
            let paths = resolve_all(&session, &files)?;
            match with_bar(session.export_zip(paths, Some(dest))?).await? {
                ExportOutcome::Exported {
                    path,
                    written,
                    skipped,
                } => println!("Exported {} archives to {} ({} skipped)", written, path.display(), skipped),
                ExportOutcome::Cancelled => println!("Export cancelled"),
            }
        }

        Commands::Rotate {
            characters,
            weapons,
            show,
        } => {
            let mut rotation = session.mod_rotation();
            if characters.is_some() || weapons.is_some() {
                rotation.enable_characters = characters.unwrap_or(rotation.enable_characters);
                rotation.enable_weapons = weapons.unwrap_or(rotation.enable_weapons);
                session.set_mod_rotation(rotation)?;
            }
            println!(
                "Rotation: characters {}, weapons {}",
                if rotation.enable_characters { "on" } else { "off" },
                if rotation.enable_weapons { "on" } else { "off" }
            );
            if show {
                return Ok(());
            }
            if !rotation.is_enabled() {
                bail!("Rotation is off; pass --characters true or --weapons true");
            }

            let report = session.rotate_mods().await?;
            for (tag, name) in &report.picks {
                println!("{:<12} {}", tag, name);
            }
            print_batch("Disable", &report.disabled);
            print_batch("Enable", &report.enabled);
        }

        Commands::Install { files } => {
            print_batch("Install", &session.handle_file_drop(files).await?);
        }

        Commands::Workshop { url } => {
            let details = session.workshop_details(&url).await?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }

        Commands::Download { url, direct, fast } => {
            let source = if direct {
                DownloadSource::direct(&url)
            } else {
                session.workshop_details(&url).await?.to_source()
            };

            let mut events = session.subscribe_downloads()?;
            let task = session.start_download(source, Some(fast))?;
            println!("Downloading {}", if task.source.title.is_empty() { &url } else { &task.source.title });

            let pb = ProgressBar::new(task.total_bytes);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) | {msg}")?
                    .progress_chars("=>-"),
            );

            let finished = loop {
                match events.recv().await {
                    Ok(TaskEvent::TaskProgress(t)) | Ok(TaskEvent::TaskUpdated(t)) if t.id == task.id => {
                        pb.set_length(t.total_bytes.max(t.downloaded_bytes));
                        pb.set_position(t.downloaded_bytes);
                        pb.set_message(t.status.to_string());
                        if t.status.is_finished() {
                            break t;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        bail!("Download manager went away")
                    }
                }
            };
            pb.finish_and_clear();

            match finished.status {
                DownloadStatus::Completed => {
                    let output = finished.output.unwrap_or_default();
                    println!("Saved {}", output.display());
                }
                _ => bail!(
                    "Download {}: {}",
                    finished.status,
                    finished.error.unwrap_or_default()
                ),
            }
        }
    }

    Ok(())
}
