//! syndica-send - Background daemon for scheduled publishing
//!
//! Sweeps the intent queue at a regular interval and dispatches due post
//! intents to their platforms.

use clap::Parser;
use libsyndica::billing::TracingSink;
use libsyndica::executor::RetryPolicy;
use libsyndica::logging::{LogFormat, LoggingConfig};
use libsyndica::{
    AdapterRegistry, Config, Database, DispatchEngine, Executor, Result, Scheduler, Vault,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "syndica-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled publishing")]
#[command(long_about = "\
syndica-send - Background daemon for scheduled publishing

DESCRIPTION:
    syndica-send is a long-running daemon that monitors the Syndica intent
    queue and publishes due content to the connected platforms.

    Each sweep returns stuck claims from dead workers to the pool, then
    dispatches every due intent with retries, credential refresh, and
    durable status tracking. Sweeps are safe to run from multiple
    processes at once.

USAGE:
    # Run in foreground (logs to stderr)
    syndica-send

    # Run with custom poll interval
    syndica-send --poll-interval 30

    # Enable verbose logging
    syndica-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes in-flight dispatches)

CONFIGURATION:
    Configuration file: ~/.config/syndica/config.toml
    Override with SYNDICA_CONFIG.

    Key material comes from [vault].key and [handshake].signing_key, or the
    SYNDICA_VAULT_KEY / SYNDICA_STATE_KEY environment variables.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or credential error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to sweep for due intents (default: 60)")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log output format: text, json, or pretty
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    /// Run one sweep and exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::new(cli.log_format, "info".to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(poll_interval) = cli.poll_interval {
        config.scheduler.poll_interval = poll_interval;
    }

    info!("syndica-send daemon starting");

    let db = Database::new(&config.database.path).await?;
    let vault = Vault::new(config.vault_key()?, db.clone());
    let registry = Arc::new(AdapterRegistry::new(&config)?);

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let executor = Arc::new(
        Executor::new(vault, RetryPolicy::from_config(&config.scheduler))
            .with_shutdown(shutdown.clone()),
    );
    let engine = Arc::new(DispatchEngine::new(
        db.clone(),
        registry,
        executor,
        Arc::new(TracingSink),
    ));
    let scheduler = Scheduler::new(db, engine, config.scheduler.clone(), shutdown);

    if cli.once {
        let stats = scheduler.run_once().await?;
        info!(
            published = stats.published,
            failed = stats.failed,
            "single sweep complete, exiting"
        );
    } else {
        info!(poll_interval = config.scheduler.poll_interval, "entering sweep loop");
        scheduler.run().await;
    }

    info!("syndica-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
        libsyndica::SyndicaError::InvalidInput(format!("Signal setup failed: {}", e))
    })?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    let _ = shutdown;
    Ok(())
}
