use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use djvu_reader_core::{DocumentSession, RecentDocuments, ViewMode, ViewerConfig};
use djvu_reader_engine::{DocumentBackend, PageDecoder};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Parser)]
#[command(name = "djvu-reader")]
#[command(about = "DJVU and PDF reader")]
pub struct Cli {
    /// Configuration file to use instead of the default location.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Do not record opened documents in the recent list.
    #[arg(long, global = true)]
    no_history: bool,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print machine-readable document metadata.
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Decode one page and write it as PNG.
    Render {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// 1-based page number.
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
    /// Decode every page in the background and report progress.
    Sweep {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// View mode to sweep in (single or continuous).
        #[arg(long)]
        mode: Option<ViewMode>,
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// List recently opened documents.
    Recent {
        /// Forget every recent document.
        #[arg(long)]
        clear: bool,
    },
    /// Print the effective configuration as TOML.
    Config,
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    path: String,
    kind: String,
    page_count: u32,
}

#[derive(Debug, Serialize)]
struct SweepOutput {
    path: String,
    kind: String,
    mode: ViewMode,
    page_count: u32,
    materialized: usize,
    progress: f64,
    elapsed_ms: u64,
    cache: CacheOutput,
    scheduler: SchedulerOutput,
}

#[derive(Debug, Serialize)]
struct CacheOutput {
    entries: usize,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Serialize)]
struct SchedulerOutput {
    submitted: u64,
    promoted: u64,
    coalesced: u64,
    dispatched: u64,
    completed: u64,
    failed: u64,
    discarded: u64,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    match cli.command {
        Commands::Info { ref file } => {
            let config = load_config(cli.config.as_deref())?;
            run_info(&config, file)?;
            remember(&cli, file);
            Ok(())
        }
        Commands::Render { ref file, page, ref output, timeout_secs } => {
            let config = load_config(cli.config.as_deref())?;
            run_render(config, file, page, output.as_deref(), Duration::from_secs(timeout_secs))?;
            remember(&cli, file);
            Ok(())
        }
        Commands::Sweep { ref file, mode, timeout_secs } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(mode) = mode {
                config = config.with_initial_view_mode(mode);
            }
            run_sweep(config, file, Duration::from_secs(timeout_secs))?;
            remember(&cli, file);
            Ok(())
        }
        Commands::Recent { clear } => run_recent(clear),
        Commands::Config => {
            let config = load_config(cli.config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // A subscriber may already be installed when `run` is called twice in one process.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<ViewerConfig> {
    let config = match path {
        Some(path) => ViewerConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?
            .apply_env(),
        None => ViewerConfig::load(),
    };
    config.context("invalid configuration")
}

fn run_info(config: &ViewerConfig, file: &Path) -> Result<()> {
    ensure_document_exists(file)?;

    let backend = DocumentBackend::new(config.pdf_options(), config.djvu_options());
    let opened = backend.open(file).context("failed to open document")?;

    let payload = InfoOutput {
        path: file.display().to_string(),
        kind: opened.kind.to_string(),
        page_count: opened.page_count,
    };
    backend.close(opened.handle);

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_render(
    config: ViewerConfig,
    file: &Path,
    page: u32,
    output: Option<&Path>,
    timeout: Duration,
) -> Result<()> {
    ensure_document_exists(file)?;
    if page == 0 {
        bail!("--page is 1-based and must be >= 1");
    }

    let session = DocumentSession::from_config(config.with_initial_view_mode(ViewMode::Single))
        .context("failed to start reader session")?;
    let opened = session.load_document(file).context("failed to open document")?;
    if page > opened.page_count {
        bail!("page {page} is out of range (document has {} pages)", opened.page_count);
    }

    let page_index = page - 1;
    session.go_to_page(page_index);
    let settled = session.wait_until(timeout, |s| {
        s.displayed_page() == Some(page_index) || (!s.is_loading && s.error_message.is_some())
    });
    if !settled {
        bail!("timed out waiting for page {page}");
    }

    let snapshot = session.snapshot();
    let bitmap = match snapshot.current_bitmap {
        Some(bitmap) if bitmap.page_index == page_index => bitmap,
        _ => bail!(
            "failed to render page {page}: {}",
            snapshot.error_message.unwrap_or_else(|| "unknown error".to_string())
        ),
    };

    let output = output
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default_render_output(file, page));
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    bitmap
        .image
        .save(&output)
        .with_context(|| format!("failed to write image to {}", output.display()))?;

    println!("{}", output.display());
    Ok(())
}

fn run_sweep(config: ViewerConfig, file: &Path, timeout: Duration) -> Result<()> {
    ensure_document_exists(file)?;

    let started = Instant::now();
    let session = DocumentSession::from_config(config).context("failed to start reader session")?;
    let opened = session.load_document(file).context("failed to open document")?;

    if !session.wait_settled(timeout) {
        bail!("timed out after {}s while decoding pages", timeout.as_secs());
    }

    let snapshot = session.snapshot();
    if snapshot.current_bitmap.is_none() {
        if let Some(message) = snapshot.error_message {
            bail!("{message}");
        }
    }

    let cache = session.cache_stats();
    let scheduler = session.scheduler_stats();
    let payload = SweepOutput {
        path: file.display().to_string(),
        kind: opened.kind.to_string(),
        mode: snapshot.view_mode,
        page_count: snapshot.total_pages,
        materialized: snapshot.continuous_pages.len(),
        progress: snapshot.continuous_progress,
        elapsed_ms: started.elapsed().as_millis() as u64,
        cache: CacheOutput {
            entries: cache.page_count,
            capacity: cache.capacity,
            hits: cache.hits,
            misses: cache.misses,
            evictions: cache.evictions,
        },
        scheduler: SchedulerOutput {
            submitted: scheduler.submitted,
            promoted: scheduler.promoted,
            coalesced: scheduler.coalesced,
            dispatched: scheduler.dispatched,
            completed: scheduler.completed,
            failed: scheduler.failed,
            discarded: scheduler.discarded,
        },
    };

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_recent(clear: bool) -> Result<()> {
    let mut recent = RecentDocuments::new();
    if clear {
        recent.save().context("failed to clear recent documents")?;
        return Ok(());
    }

    recent.load().context("failed to read recent documents")?;
    let paths: Vec<String> = recent
        .documents()
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    println!("{}", serde_json::to_string_pretty(&paths)?);
    Ok(())
}

fn remember(cli: &Cli, file: &Path) {
    if cli.no_history {
        return;
    }

    let path = fs::canonicalize(file).unwrap_or_else(|_| file.to_path_buf());
    let mut recent = RecentDocuments::new();
    if let Err(error) = recent.load() {
        tracing::warn!(%error, "ignoring unreadable recent documents list");
    }
    recent.add(path);
    if let Err(error) = recent.save() {
        tracing::warn!(%error, "could not save recent documents");
    }
}

fn ensure_document_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn default_render_output(file: &Path, page: u32) -> PathBuf {
    let stem = file.file_stem().and_then(|name| name.to_str()).unwrap_or("page");

    file.with_file_name(format!("{stem}-page-{page}.png"))
}
