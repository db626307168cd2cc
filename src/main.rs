use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mailsync::account::{ProviderBackends, SynchronizerFactory};
use mailsync::cache::{Cache, ChangeProcessor};
use mailsync::config::Config;
use mailsync::sync::{SyncType, SynchronizationOptions, SynchronizationResult, SynchronizerState};

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mailsync=debug"));

    let log_file = Config::config_dir()
        .ok()
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir.join("mailsync.log")))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        // Fallback to stderr if file logging fails
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"mailsync - Mail and calendar synchronization daemon

Usage: mailsync [command]

Commands:
    (none)            Run the daemon: periodic sync of every configured account
    sync <account>    Run one full sync of the account and exit
    help              Show this help message

Configuration file: ~/.config/mailsync/config.toml
Logs: ~/.config/mailsync/mailsync.log (RUST_LOG overrides the level)
"#
    );
}

async fn open_cache(config: &Config) -> Result<Arc<Cache>> {
    config.ensure_dirs()?;
    let path = config.cache_path()?;
    let cache = Cache::open(&path)
        .await
        .with_context(|| format!("Failed to open cache at {}", path.display()))?;
    Ok(Arc::new(cache))
}

fn log_result(account_id: &str, result: &SynchronizationResult) {
    match &result.error {
        None => tracing::info!(
            "Sync of '{}' finished ({:?}): {} new items, {} requests executed",
            account_id,
            result.completed_state,
            result.downloaded_items.len(),
            result.requests.succeeded
        ),
        Some(e) => tracing::error!("Sync of '{}' failed: {}", account_id, e),
    }
}

async fn run_sync(config: Config, account_id: &str) -> Result<()> {
    let account = config
        .account(account_id)
        .with_context(|| format!("No account '{}' in configuration", account_id))?
        .clone();

    let cache = open_cache(&config).await?;
    let factory = SynchronizerFactory::new(cache, ProviderBackends);
    let handle = factory.get_or_create(&account).await?;

    let result = handle
        .synchronize(SynchronizationOptions::new(account_id, SyncType::Full))
        .await;
    factory.shutdown_all().await;
    log_result(account_id, &result);

    println!("Account:     {}", account_id);
    println!("Result:      {:?}", result.completed_state);
    println!("Downloaded:  {}", result.downloaded_items.len());
    println!("Threads:     {}", result.threads.len());
    println!(
        "Requests:    {} succeeded, {} failed",
        result.requests.succeeded,
        result.requests.failed.len()
    );

    match result.error {
        Some(e) => Err(anyhow::anyhow!("Synchronization of '{}' failed: {}", account_id, e)),
        None => Ok(()),
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    let cache = open_cache(&config).await?;
    let factory = SynchronizerFactory::new(cache.clone(), ProviderBackends);

    let mut handles = Vec::new();
    for account in &config.accounts {
        match factory.get_or_create(account).await {
            Ok(handle) => handles.push(handle),
            Err(e) => tracing::error!("Skipping account '{}': {:#}", account.id, e),
        }
    }
    if handles.is_empty() {
        anyhow::bail!("No usable accounts configured. See 'mailsync help'.");
    }
    tracing::info!("mailsync started with {} accounts", handles.len());

    let mut sync_tick = tokio::time::interval(Duration::from_secs(config.sync.interval_secs.max(1)));
    sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep_tick = tokio::time::interval(Duration::from_secs(config.sync.retry_sweep_interval_secs.max(1)));
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sync_tick.tick() => {
                for handle in &handles {
                    // A cycle still in flight covers this tick
                    if !matches!(handle.state(), SynchronizerState::Idle | SynchronizerState::Failed) {
                        continue;
                    }
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        let account_id = handle.account_id().clone();
                        let result = handle
                            .synchronize(SynchronizationOptions::new(account_id.clone(), SyncType::Full))
                            .await;
                        log_result(&account_id, &result);
                    });
                }
            }
            _ = sweep_tick.tick() => {
                match cache.sweep_retry_queue(chrono::Utc::now().timestamp()).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!("Dropped {} stale retry entries", removed),
                    Err(e) => tracing::warn!("Retry queue sweep failed: {:#}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    factory.shutdown_all().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("sync") => {
            let Some(account_id) = args.get(2) else {
                eprintln!("Missing account id");
                print_usage();
                std::process::exit(1);
            };
            setup_logging();
            run_sync(Config::load()?, account_id).await
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
        None => {
            setup_logging();
            run_daemon(Config::load()?).await
        }
    }
}
