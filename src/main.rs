//! webreg — operator console that automates account registration and
//! sign-in on one external website, keeps an SQLite audit trail, and
//! mirrors state changes to a Telegram chat.

mod browser;
mod config;
mod notifier;
mod store;
mod workflow;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::browser::SiteDriver;
use crate::config::Config;
use crate::notifier::Notifier;
use crate::store::AccountStore;
use crate::workflow::Workflow;

#[derive(Parser)]
#[command(name = "webreg", version, about = "Browser-driven account console")]
struct Cli {
    /// Path to the TOML config file (defaults to the platform config dir).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log file path. The console itself is reserved for the menu.
    #[arg(long, default_value = "webreg.log")]
    log_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_file)?;

    let config = Config::load(cli.config.as_deref())?;

    let db_path = config.database.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let store = AccountStore::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;

    let notifier = Notifier::new(&config.telegram);
    if config.telegram.is_configured() {
        if notifier.health_check().await {
            tracing::info!("Telegram bot authenticated");
        } else {
            tracing::warn!("Telegram bot unreachable; notifications will be best-effort");
            println!("Warning: Telegram bot unreachable, notifications may be dropped.");
        }
    } else {
        tracing::warn!("Telegram not configured; notifications will be dropped");
        println!("Warning: Telegram is not configured, notifications will be dropped.");
    }
    let (notifier_handle, notifier_worker) = notifier::spawn(notifier);

    let driver = SiteDriver::new(config.site, config.webdriver);

    let mut workflow = Workflow::new(store, driver, notifier_handle);
    let result = workflow.run().await;

    // Dropping the workflow drops the last notifier handle; the worker
    // drains what is queued and exits, so awaiting it is the guarantee
    // that no message is left in flight.
    drop(workflow);
    if let Err(e) = notifier_worker.await {
        tracing::error!("Notifier worker did not exit cleanly: {e}");
    }
    tracing::info!("Shut down");
    result
}

fn init_logging(path: &Path) -> Result<()> {
    let file = std::fs::File::options()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .init();
    Ok(())
}
