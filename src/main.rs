use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use feedwatch::config::Config;
use feedwatch::dispatch::{LogDispatcher, LogNotifier};
use feedwatch::feed::HttpFeedSource;
use feedwatch::scheduler::{FeedUpdateHandler, Scheduler, SchedulerHandle, UpdateSummary};
use feedwatch::storage::{
    parse_legacy_document, ConfigBackend, ConfigManager, Database, MemoryBackend, StorageError,
    DUMMY_RSSFEED_KEY,
};

/// Get the config directory path (~/.config/feedwatch/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedwatch"))
}

/// Create the config directory user-only; it ends up holding cookies and SMTP credentials.
fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).with_context(|| {
            format!("Failed to create config directory '{}'", config_dir.display())
        })?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(config_dir, perms) {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "feedwatch",
    version,
    about = "Watches torrent RSS feeds and adds new matches to your torrent client"
)]
struct Args {
    /// Settings file (default: ~/.config/feedwatch/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Keep feeds and subscriptions in memory only; nothing is written to disk
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Run one update cycle and exit
    Update {
        #[arg(long, value_name = "KEY", conflicts_with = "subscription", required_unless_present = "subscription")]
        feed: Option<String>,
        #[arg(long, value_name = "KEY")]
        subscription: Option<String>,
    },
    /// Show which items of a feed a subscription would match, without adding anything
    Preview {
        #[arg(long, value_name = "KEY")]
        subscription: String,
    },
    /// List feeds and subscriptions
    List,
    /// Replace the stored feeds and subscriptions with a legacy JSON config file
    Import {
        file: PathBuf,
        /// Config version to assume when the file has no version header
        #[arg(long, default_value_t = 1)]
        from_version: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (settings_path, config_dir) = match &args.config {
        Some(path) => {
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (path.clone(), dir)
        }
        None => {
            let dir = get_config_dir()?;
            (dir.join("config.toml"), dir)
        }
    };
    let settings = Config::load(&settings_path)
        .with_context(|| format!("Failed to load settings from '{}'", settings_path.display()))?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let backend = open_backend(&args, &settings, &config_dir).await?;

    match args.command {
        Command::Run => run_daemon(backend, &settings).await,
        Command::Update { feed, subscription } => {
            update_once(backend, &settings, feed, subscription).await
        }
        Command::Preview { subscription } => preview(backend, &settings, &subscription).await,
        Command::List => list(backend).await,
        Command::Import { file, from_version } => import(backend, &file, from_version).await,
    }
}

async fn open_backend(
    args: &Args,
    settings: &Config,
    config_dir: &Path,
) -> Result<Arc<dyn ConfigBackend>> {
    if args.ephemeral {
        tracing::info!("Using in-memory config store");
        return Ok(Arc::new(MemoryBackend::new()));
    }

    ensure_config_dir(config_dir)?;
    let db_path = settings.database_path_in(config_dir);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    match Database::open(db_path_str).await {
        Ok(db) => Ok(Arc::new(db)),
        Err(StorageError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of feedwatch appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::Error::new(e).context("Failed to open database")),
    }
}

/// Load the config store and wire a scheduler around it.
async fn start_scheduler(
    backend: Arc<dyn ConfigBackend>,
    settings: &Config,
) -> Result<(Scheduler, SchedulerHandle)> {
    let manager = ConfigManager::load(backend)
        .await
        .context("Failed to load feeds and subscriptions")?;
    let source =
        HttpFeedSource::new(settings.fetch_settings()).context("Failed to create HTTP client")?;
    let handler = FeedUpdateHandler::new(Arc::new(source), settings.default_user_agent.clone());

    Ok(Scheduler::new(
        manager,
        handler,
        Arc::new(LogDispatcher),
        Arc::new(LogNotifier),
        settings.run_queue_concurrency,
    ))
}

async fn run_daemon(backend: Arc<dyn ConfigBackend>, settings: &Config) -> Result<()> {
    let (mut scheduler, handle) = start_scheduler(backend, settings).await?;
    scheduler.enable_timers();
    let feeds = scheduler
        .config()
        .rssfeeds
        .values()
        .filter(|f| f.active)
        .count();
    tracing::info!(active_feeds = feeds, "Scheduler started");

    let task = tokio::spawn(scheduler.run());
    wait_for_shutdown_signal().await?;

    tracing::info!("Shutting down");
    handle.shutdown().await.context("Scheduler stopped unexpectedly")?;
    task.await.context("Scheduler task failed")?;
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
    }
    Ok(())
}

async fn update_once(
    backend: Arc<dyn ConfigBackend>,
    settings: &Config,
    feed: Option<String>,
    subscription: Option<String>,
) -> Result<()> {
    let (scheduler, handle) = start_scheduler(backend, settings).await?;
    let task = tokio::spawn(scheduler.run());

    let summary = match (feed, subscription) {
        (Some(feed), _) => handle.run_feed_now(&feed).await?,
        (None, Some(subscription)) => handle.run_subscription_now(&subscription).await?,
        (None, None) => anyhow::bail!("Either --feed or --subscription is required"),
    };

    handle.shutdown().await?;
    task.await.context("Scheduler task failed")?;

    print_summary(&summary);
    if let Some(error) = summary.error {
        anyhow::bail!(error);
    }
    Ok(())
}

fn print_summary(summary: &UpdateSummary) {
    println!(
        "Feed {}: {} matched, {} added, {} failed",
        summary.feed_key.as_deref().unwrap_or("?"),
        summary.matched,
        summary.added,
        summary.failed
    );
    if let Some(interval) = summary.new_interval {
        println!("Update interval changed to {interval} minutes (feed TTL)");
    }
    for warning in &summary.warnings {
        println!("Warning: {warning}");
    }
}

async fn preview(
    backend: Arc<dyn ConfigBackend>,
    settings: &Config,
    subscription_key: &str,
) -> Result<()> {
    let (scheduler, handle) = start_scheduler(backend, settings).await?;
    let subscription = scheduler
        .config()
        .subscriptions
        .get(subscription_key)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("No subscription with key {subscription_key}"))?;
    let task = tokio::spawn(scheduler.run());

    let outcome = handle.preview(subscription).await;
    handle.shutdown().await?;
    task.await.context("Scheduler task failed")?;
    let outcome = outcome.context("Preview failed")?;

    for item in outcome.items.values() {
        let mark = if item.matches { "x" } else { " " };
        let published = item
            .published
            .map(|p| p.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("[{mark}] {published}  {}", item.title);
    }
    println!(
        "{} of {} items match",
        outcome.matched_keys.len(),
        outcome.items.len()
    );
    for warning in &outcome.warnings {
        println!("Warning: {warning}");
    }
    Ok(())
}

async fn list(backend: Arc<dyn ConfigBackend>) -> Result<()> {
    let manager = ConfigManager::load(backend)
        .await
        .context("Failed to load feeds and subscriptions")?;
    let config = manager.get_config();

    for feed in config.rssfeeds.values() {
        if feed.key == DUMMY_RSSFEED_KEY {
            continue;
        }
        let state = if feed.active { "active" } else { "inactive" };
        println!(
            "feed {:>4}  {:<24} every {:>4} min  {:<8} {}",
            feed.key, feed.name, feed.update_interval, state, feed.url
        );
        for sub in config.subscriptions_for(&feed.key) {
            println!(
                "  subscription {:>4}  {:<24} include {:?} exclude {:?}",
                sub.key, sub.name, sub.regex_include, sub.regex_exclude
            );
        }
    }

    let parked: Vec<_> = config.subscriptions_for(DUMMY_RSSFEED_KEY).collect();
    if !parked.is_empty() {
        println!("Subscriptions without a feed:");
        for sub in parked {
            println!("  subscription {:>4}  {}", sub.key, sub.name);
        }
    }
    Ok(())
}

async fn import(backend: Arc<dyn ConfigBackend>, file: &Path, from_version: u32) -> Result<()> {
    let metadata = std::fs::metadata(file)
        .with_context(|| format!("Failed to read import file: {}", file.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("Import path must be a regular file");
    }
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read import file: {}", file.display()))?;

    let (document, version) = parse_legacy_document(&content, from_version)
        .context("File does not look like a feedwatch config")?;
    let manager = ConfigManager::import(backend, document, version)
        .await
        .context("Failed to store imported config")?;

    let config = manager.get_config();
    println!(
        "Imported {} feeds, {} subscriptions and {} cookie sets (config version {})",
        config.rssfeeds.len(),
        config.subscriptions.len(),
        config.cookies.len(),
        version
    );
    Ok(())
}
