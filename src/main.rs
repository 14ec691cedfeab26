// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use assetlib::{
    canonical_url, mask_sensitive, Asset, AssetError, AssetLibrary, CleanupReport, LibraryConfig,
    UpdateFlags, VersionSnapshot,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long `fetch` waits for the library to resolve a URL.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a `fetch` download when no request timeout is configured.
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Spinner helpers for consistent progress indicators
mod spinner {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner()
            .tick_chars("\u{28FB}\u{28F9}\u{28FC}\u{28F8}\u{28FE}\u{28F6}\u{28F7}\u{28E7}\u{28CF}\u{28DF} ")
            .template("{spinner:.cyan} {msg}")
        {
            spinner.set_style(style);
        }
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }

    pub fn finish_success(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("\x1b[32m[OK]\x1b[0m {}", message);
    }

    pub fn finish_warning(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("\x1b[33m[!]\x1b[0m {}", message);
    }

    pub fn finish_error(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("\x1b[31m[X]\x1b[0m {}", message);
    }
}

#[derive(Parser)]
#[command(name = "assetlib")]
#[command(version = VERSION)]
#[command(about = "Versioned cache for remote files", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (defaults to <config dir>/assetlib/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the cache root from the config file
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Do not touch the network; TTL cleanup is skipped as well
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download (or revalidate) a URL and print the readable file path
    Fetch {
        url: String,
        /// Seconds an unused asset is kept before cleanup removes it (0 = forever)
        #[arg(long, default_value_t = 86_400)]
        ttl: u64,
    },
    /// Show what the cache holds for a URL
    Show {
        url: String,
        /// Acquiring refreshes the stored TTL, so pass the one the asset uses
        #[arg(long, default_value_t = 86_400)]
        ttl: u64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove expired assets now
    Sweep,
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(LibraryConfig::default_path);
    let mut config = LibraryConfig::load(&config_path)?;
    if let Some(root) = cli.root.clone() {
        config.cache_root = root;
    }
    if cli.offline {
        config.offline = true;
    }

    match cli.command {
        Commands::Config => show_config(&config, &config_path),
        Commands::Fetch { url, ttl } => {
            let deadline = download_deadline(&config);
            let library = open_library(config)?;
            fetch(&library, &url, Duration::from_secs(ttl), deadline)
        }
        Commands::Show { url, ttl, json } => {
            let library = open_library(config)?;
            show(&library, &url, Duration::from_secs(ttl), json)
        }
        Commands::Sweep => {
            let library = open_library(config)?;
            sweep(&library)
        }
    }
}

/// `RUST_LOG` wins; otherwise only our own info-level events are shown.
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("assetlib=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_library(config: LibraryConfig) -> Result<AssetLibrary> {
    let root = config.cache_root.clone();
    AssetLibrary::new(config).with_context(|| format!("Failed to open asset library at {:?}", root))
}

/// Acquire `url` through the library and pump until it resolves.
fn acquire(library: &AssetLibrary, url: &str, ttl: Duration) -> Result<Arc<Asset>> {
    let canonical = canonical_url(url).ok_or_else(|| anyhow!("Not a valid asset URL: {}", url))?;
    let slot: Arc<Mutex<Option<Option<Arc<Asset>>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    if !library.acquire_asset(
        &canonical,
        ttl,
        move |asset| {
            if let Ok(mut slot) = sink.lock() {
                *slot = Some(asset);
            }
        },
        None,
    ) {
        return Err(AssetError::ShuttingDown.into());
    }

    let resolved = library.wait_until(ACQUIRE_TIMEOUT, || {
        slot.lock().map(|s| s.is_some()).unwrap_or(true)
    });
    if !resolved {
        return Err(anyhow!("Timed out waiting for {}", canonical));
    }
    let asset = slot
        .lock()
        .map_err(|_| anyhow!("Acquire callback panicked"))?
        .take()
        .flatten();
    asset.ok_or_else(|| anyhow!("Failed to acquire {}", canonical))
}

/// How long `fetch` pumps for a download: the request timeout plus slack
/// for the completion to reach the main thread.
fn download_deadline(config: &LibraryConfig) -> Duration {
    config
        .request_timeout()
        .map(|timeout| timeout + ACQUIRE_TIMEOUT)
        .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT)
}

fn fetch(library: &AssetLibrary, url: &str, ttl: Duration, deadline: Duration) -> Result<()> {
    let asset = acquire(library, url, ttl)?;

    let finished = Arc::new(AtomicBool::new(false));
    let succeeded = Arc::new(AtomicBool::new(false));
    let spinner = spinner::create(&format!("Fetching {}", asset.url()));
    {
        let finished = Arc::clone(&finished);
        let succeeded = Arc::clone(&succeeded);
        let bar = spinner.clone();
        asset.subscribe(move |asset, flags| {
            if flags.contains(UpdateFlags::DOWNLOAD_PROGRESS) {
                let progress = asset
                    .versions()
                    .iter()
                    .filter(|v| !v.complete)
                    .map(|v| v.progress)
                    .fold(0.0_f32, f32::max);
                bar.set_message(format!("Fetching {} ({:.0}%)", asset.url(), progress * 100.0));
            }
            if flags.contains(UpdateFlags::DOWNLOAD_COMPLETED) {
                succeeded.store(!flags.contains(UpdateFlags::DOWNLOAD_FAILED), Ordering::SeqCst);
                finished.store(true, Ordering::SeqCst);
            }
        });
    }

    if library.is_offline() {
        spinner::finish_warning(&spinner, "Offline, using cached data only");
    } else if asset.download() {
        if !library.wait_until(deadline, || finished.load(Ordering::SeqCst)) {
            spinner::finish_error(&spinner, &format!("Timed out fetching {}", asset.url()));
            return Err(anyhow!("Timed out after {}s waiting for {}", deadline.as_secs(), asset.url()));
        }
        if succeeded.load(Ordering::SeqCst) {
            spinner::finish_success(&spinner, &format!("Fetched {}", asset.url()));
        } else {
            spinner::finish_warning(&spinner, &format!("Download of {} failed", asset.url()));
        }
    } else {
        spinner::finish_error(&spinner, "Download could not be queued");
    }

    match asset.readable_version() {
        Some(version) => {
            println!("{}", version.path.display());
            Ok(())
        }
        None => Err(anyhow!("No readable version of {}", asset.url())),
    }
}

fn show(library: &AssetLibrary, url: &str, ttl: Duration, json: bool) -> Result<()> {
    let asset = acquire(library, url, ttl)?;
    let versions = asset.versions();

    if json {
        let out = serde_json::json!({
            "id": asset.id(),
            "url": asset.url(),
            "ttl_secs": asset.ttl().as_secs(),
            "touch": asset.touch_time(),
            "data": asset.data(),
            "versions": versions,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{} {}", "Asset".bold(), asset.url().cyan());
    println!("  id:      {}", asset.id());
    println!("  ttl:     {}s", asset.ttl().as_secs());
    println!("  touched: {}", assetlib::utils::micros_to_utc(asset.touch_time()).to_rfc3339());
    println!("  cache:   {}", asset.cache_path().display());
    if versions.is_empty() {
        println!("  {}", "no versions on disk".dimmed());
    }
    for version in &versions {
        print_version(version);
    }
    Ok(())
}

fn print_version(version: &VersionSnapshot) {
    let state = if version.complete {
        "complete".green()
    } else {
        format!("partial {:.0}%", version.progress * 100.0).yellow()
    };
    println!(
        "  [{}] {} {} bytes, etag {:?}, {}",
        version.id,
        state,
        version.size,
        version.etag,
        assetlib::utils::micros_to_utc(version.ctime).to_rfc3339()
    );
    println!("      {}", version.path.display().to_string().dimmed());
}

fn sweep(library: &AssetLibrary) -> Result<()> {
    let spinner = spinner::create("Sweeping expired assets");
    let report: Arc<Mutex<Option<Option<CleanupReport>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&report);
    library.cleanup_with(move |result| {
        if let Ok(mut slot) = sink.lock() {
            *slot = Some(result);
        }
    });
    library.wait_until(ACQUIRE_TIMEOUT, || {
        report.lock().map(|r| r.is_some()).unwrap_or(true)
    });

    let result = report
        .lock()
        .map_err(|_| anyhow!("Cleanup callback panicked"))?
        .take();
    match result {
        Some(Some(report)) => {
            spinner::finish_success(
                &spinner,
                &format!(
                    "Removed {} asset directories and {} records",
                    report.directories_removed, report.rows_removed
                ),
            );
            Ok(())
        }
        Some(None) if library.is_offline() => {
            spinner::finish_warning(&spinner, "Offline, cleanup skipped");
            Ok(())
        }
        _ => {
            spinner::finish_error(&spinner, "Cleanup failed");
            Err(anyhow!("Cleanup failed"))
        }
    }
}

fn show_config(config: &LibraryConfig, path: &std::path::Path) -> Result<()> {
    println!("{} {}", "Config".bold(), path.display().to_string().dimmed());
    println!("  cache_root:          {}", config.cache_root.display());
    println!("  database:            {}", config.database_path().display());
    println!("  sharegroup:          {}", config.sharegroup);
    println!("  max_active_requests: {}", config.max_active_requests);
    println!("  progress_interval:   {}ms", config.progress_interval_ms);
    println!("  offline:             {}", config.offline);
    match &config.signing {
        Some(signing) => println!(
            "  signing:             {} {} (secret {})",
            signing.app_name,
            signing.app_version,
            mask_sensitive(&signing.secret, 4)
        ),
        None => println!("  signing:             {}", "disabled".dimmed()),
    }
    Ok(())
}
