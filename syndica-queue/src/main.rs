//! syndica-queue - Manage publish intents and platform connections
//!
//! Unix-style tool for managing the Syndica intent queue.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use libsyndica::billing::UnlimitedChecker;
use libsyndica::handshake::Callback;
use libsyndica::{
    Config, Database, HandshakeManager, IntentService, IntentStatus, PlatformId, PostIntent,
    PublishContent, Result, SyndicaError, Vault,
};

#[derive(Parser, Debug)]
#[command(name = "syndica-queue")]
#[command(version)]
#[command(about = "Manage publish intents and platform connections")]
#[command(long_about = "\
syndica-queue - Manage publish intents and platform connections

DESCRIPTION:
    syndica-queue is a Unix-style tool for managing the Syndica intent queue.
    Use it to schedule, list, cancel, reschedule, or retry publish intents,
    and to connect or disconnect platform accounts.

COMMANDS:
    list        List publish intents
    add         Schedule a new publish intent
    cancel      Cancel a scheduled intent
    reschedule  Reschedule an intent to a different time
    now         Move a scheduled intent to the front of the queue
    retry       Re-queue a failed intent as a fresh one
    stats       Show queue statistics
    connect     Start an account connection, printing the authorization URL
    finish      Complete an account connection from the provider redirect
    disconnect  Remove a stored platform connection
    accounts    Show which platforms a user has connected

USAGE EXAMPLES:
    # Schedule a post for tomorrow afternoon
    syndica-queue add --user alice --platform buzzly --text \"launch day\" --time \"tomorrow 3pm\"

    # List scheduled intents for one user
    syndica-queue list --user alice --status scheduled

    # List intents in JSON format
    syndica-queue list --format json

    # Cancel a specific intent
    syndica-queue cancel <INTENT_ID>

    # Publish a scheduled intent on the next sweep
    syndica-queue now <INTENT_ID>

    # Connect an account (prints the URL to open in a browser)
    syndica-queue connect --user alice --platform buzzly

    # Complete the connection from the redirect parameters
    syndica-queue finish --state <STATE> --code <CODE>

CONFIGURATION:
    Configuration file: ~/.config/syndica/config.toml
    Database location: set by database.path in the config file

    Override with environment variables:
        SYNDICA_CONFIG      - Path to config file
        SYNDICA_VAULT_KEY   - Hex-encoded vault encryption key
        SYNDICA_STATE_KEY   - Hex-encoded state signing key

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad intent ID, time format, etc.)

For more information, visit: https://github.com/syndica-tools/syndica
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List publish intents
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Filter by user
        #[arg(short, long)]
        user: Option<String>,

        /// Filter by status: scheduled, dispatching, published, failed
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of intents to show
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },

    /// Schedule a new publish intent
    Add {
        /// User the intent belongs to
        #[arg(short, long)]
        user: String,

        /// Target platform: buzzly, loopd, or pagely
        #[arg(short, long)]
        platform: String,

        /// Post text
        #[arg(short, long)]
        text: String,

        /// Media URL to attach (repeatable)
        #[arg(short, long)]
        media: Vec<String>,

        /// Schedule time (e.g., "now", "+2h", "tomorrow 3pm")
        #[arg(long, default_value = "now")]
        time: String,

        /// Platform-specific options as a JSON object
        #[arg(long)]
        options: Option<String>,
    },

    /// Cancel a scheduled intent
    Cancel {
        /// Intent ID to cancel
        intent_id: Option<String>,

        /// Cancel all scheduled intents
        #[arg(long)]
        all: bool,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Reschedule an intent
    Reschedule {
        /// Intent ID to reschedule
        intent_id: String,

        /// New schedule time (e.g., "tomorrow 3pm", "+2h")
        time: String,
    },

    /// Publish on the next sweep
    Now {
        /// Intent ID to publish now
        intent_id: String,
    },

    /// Re-queue a failed intent as a fresh one
    Retry {
        /// Intent ID of the failed intent
        intent_id: String,
    },

    /// Show queue statistics
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Start an account connection
    Connect {
        /// User the connection belongs to
        #[arg(short, long)]
        user: String,

        /// Platform to connect: buzzly, loopd, or pagely
        #[arg(short, long)]
        platform: String,
    },

    /// Complete an account connection from the provider redirect
    Finish {
        /// The state parameter from the redirect
        #[arg(long)]
        state: String,

        /// The authorization code from the redirect
        #[arg(long)]
        code: Option<String>,

        /// The error code from the redirect, if the user denied access
        #[arg(long)]
        error: Option<String>,
    },

    /// Remove a stored platform connection
    Disconnect {
        /// User the connection belongs to
        #[arg(short, long)]
        user: String,

        /// Platform to disconnect
        #[arg(short, long)]
        platform: String,
    },

    /// Show which platforms a user has connected
    Accounts {
        /// User to inspect
        #[arg(short, long)]
        user: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("error")
            .with_writer(std::io::stderr)
            .init();
    }

    // Run the main logic and handle errors
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db = Database::new(&config.database.path).await?;

    // Quota enforcement lives in the hosted API layer; the local queue
    // tool operates on the owner's behalf and is unmetered.
    let intents = IntentService::new(db.clone(), Arc::new(UnlimitedChecker));

    // Execute command
    match cli.command {
        Commands::List {
            format,
            user,
            status,
            limit,
        } => {
            cmd_list(&db, &format, user.as_deref(), status.as_deref(), limit).await?;
        }
        Commands::Add {
            user,
            platform,
            text,
            media,
            time,
            options,
        } => {
            cmd_add(
                &intents,
                &user,
                &platform,
                text,
                media,
                &time,
                options.as_deref(),
            )
            .await?;
        }
        Commands::Cancel {
            intent_id,
            all,
            force,
        } => {
            cmd_cancel(&db, &intents, intent_id.as_deref(), all, force).await?;
        }
        Commands::Reschedule { intent_id, time } => {
            cmd_reschedule(&intents, &intent_id, &time).await?;
        }
        Commands::Now { intent_id } => {
            cmd_now(&intents, &intent_id).await?;
        }
        Commands::Retry { intent_id } => {
            cmd_retry(&intents, &intent_id).await?;
        }
        Commands::Stats { format } => {
            cmd_stats(&db, &format).await?;
        }
        Commands::Connect { user, platform } => {
            cmd_connect(&db, &config, &user, &platform).await?;
        }
        Commands::Finish { state, code, error } => {
            cmd_finish(&db, &config, &state, code.as_deref(), error.as_deref()).await?;
        }
        Commands::Disconnect { user, platform } => {
            cmd_disconnect(&db, &config, &user, &platform).await?;
        }
        Commands::Accounts { user } => {
            cmd_accounts(&db, &config, &user).await?;
        }
    }

    Ok(())
}

/// Build the handshake manager for the account commands.
fn handshake_manager(db: &Database, config: &Config) -> Result<HandshakeManager> {
    let vault = Vault::new(config.vault_key()?, db.clone());
    let registry = Arc::new(libsyndica::AdapterRegistry::new(config)?);
    HandshakeManager::new(db.clone(), vault, registry, config.clone())
}

fn parse_platform(s: &str) -> Result<PlatformId> {
    PlatformId::from_str_opt(s).ok_or_else(|| {
        SyndicaError::InvalidInput(format!(
            "Unknown platform '{}'. Must be buzzly, loopd, or pagely",
            s
        ))
    })
}

fn parse_status(s: &str) -> Result<IntentStatus> {
    match s {
        "scheduled" => Ok(IntentStatus::Scheduled),
        "dispatching" => Ok(IntentStatus::Dispatching),
        "published" => Ok(IntentStatus::Published),
        "failed" => Ok(IntentStatus::Failed),
        other => Err(SyndicaError::InvalidInput(format!(
            "Invalid status '{}'. Must be scheduled, dispatching, published, or failed",
            other
        ))),
    }
}

/// List publish intents
async fn cmd_list(
    db: &Database,
    format: &str,
    user: Option<&str>,
    status: Option<&str>,
    limit: i64,
) -> Result<()> {
    // Validate format
    if format != "text" && format != "json" {
        return Err(SyndicaError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }

    let status = status.map(parse_status).transpose()?;
    let intents = db.list_intents(user, status, limit).await?;

    // Output based on format
    if format == "json" {
        output_list_json(&intents);
    } else {
        output_list_text(&intents);
    }

    Ok(())
}

/// Output intents as JSON
fn output_list_json(intents: &[PostIntent]) {
    let json: Vec<serde_json::Value> = intents
        .iter()
        .map(|intent| {
            serde_json::json!({
                "id": intent.id,
                "user_id": intent.user_id,
                "platform": intent.platform.as_str(),
                "text": intent.content.text,
                "scheduled_at": intent.scheduled_at,
                "created_at": intent.created_at,
                "status": intent.status.to_string(),
                "canonical_url": intent.result.as_ref().map(|r| r.canonical_url.clone()),
                "error": intent.last_error.as_ref().map(|e| e.message.clone()),
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json).unwrap());
}

/// Output intents as human-readable text
fn output_list_text(intents: &[PostIntent]) {
    use chrono::Utc;

    if intents.is_empty() {
        return;
    }

    let now = Utc::now().timestamp_millis();

    for intent in intents {
        let content_preview = truncate_content(&intent.content.text, 50);
        let detail = match intent.status {
            IntentStatus::Scheduled => format_time_until(now, intent.scheduled_at),
            IntentStatus::Published => intent
                .result
                .as_ref()
                .map(|r| r.canonical_url.clone())
                .unwrap_or_else(|| "published".to_string()),
            IntentStatus::Failed => intent
                .last_error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "failed".to_string()),
            IntentStatus::Dispatching => "dispatching".to_string(),
        };

        println!(
            "{} | {} | {} | {} | {}",
            intent.id,
            intent.platform.as_str(),
            intent.status,
            content_preview,
            detail
        );
    }
}

/// Truncate content to max length with ellipsis
fn truncate_content(content: &str, max_len: usize) -> String {
    if content.chars().count() <= max_len {
        content.to_string()
    } else {
        let truncated: String = content.chars().take(max_len).collect();
        format!("{}...", truncated)
    }
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now_millis: i64, scheduled_at_millis: i64) -> String {
    let diff = (scheduled_at_millis - now_millis) / 1000;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

/// Schedule a new publish intent
async fn cmd_add(
    intents: &IntentService,
    user: &str,
    platform: &str,
    text: String,
    media: Vec<String>,
    time: &str,
    options: Option<&str>,
) -> Result<()> {
    let platform = parse_platform(platform)?;
    let scheduled_at = libsyndica::scheduling::parse_schedule_millis(time)?;
    let options = match options {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| SyndicaError::InvalidInput(format!("Invalid options JSON: {}", e)))?,
        None => serde_json::json!({}),
    };

    let content = PublishContent {
        text,
        media_urls: media,
    };
    let intent = intents
        .create(user, platform, content, options, scheduled_at)
        .await?;

    println!("Scheduled intent {}", intent.id);
    Ok(())
}

/// Cancel scheduled intent(s)
async fn cmd_cancel(
    db: &Database,
    intents: &IntentService,
    intent_id: Option<&str>,
    all: bool,
    force: bool,
) -> Result<()> {
    if all {
        let scheduled = db
            .list_intents(None, Some(IntentStatus::Scheduled), i64::MAX)
            .await?;
        if scheduled.is_empty() {
            println!("No scheduled intents to cancel");
            return Ok(());
        }

        if !force && !confirm(&format!("Cancel {} scheduled intent(s)?", scheduled.len())) {
            println!("Aborted");
            return Ok(());
        }

        let mut cancelled = 0;
        for intent in &scheduled {
            // Racing the dispatcher is fine; an intent it claimed first
            // is simply skipped.
            if intents.cancel(&intent.id).await.is_ok() {
                cancelled += 1;
            }
        }
        println!("Cancelled {} intent(s)", cancelled);
        return Ok(());
    }

    let intent_id = intent_id.ok_or_else(|| {
        SyndicaError::InvalidInput("Provide an intent ID or use --all".to_string())
    })?;
    intents.cancel(intent_id).await?;
    println!("Cancelled intent {}", intent_id);
    Ok(())
}

/// Prompt for a yes/no confirmation on stdin. Anything but an explicit
/// yes (including a read failure) counts as no.
fn confirm(prompt: &str) -> bool {
    use std::io::Write;

    print!("{} [y/N] ", prompt);
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

/// Reschedule an intent
async fn cmd_reschedule(intents: &IntentService, intent_id: &str, time: &str) -> Result<()> {
    let scheduled_at = libsyndica::scheduling::parse_schedule_millis(time)?;
    intents.reschedule(intent_id, scheduled_at).await?;

    let when = chrono::DateTime::from_timestamp_millis(scheduled_at)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| scheduled_at.to_string());
    println!("Rescheduled intent {} to {}", intent_id, when);
    Ok(())
}

/// Publish on the next sweep
async fn cmd_now(intents: &IntentService, intent_id: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp_millis();
    intents.reschedule(intent_id, now).await?;
    println!(
        "Intent {} is due now; the dispatcher will pick it up on its next sweep",
        intent_id
    );
    Ok(())
}

/// Re-queue a failed intent
async fn cmd_retry(intents: &IntentService, intent_id: &str) -> Result<()> {
    let fresh = intents.redispatch(intent_id).await?;
    println!(
        "Re-queued failed intent {} as new intent {}",
        intent_id, fresh.id
    );
    Ok(())
}

/// Show queue statistics
async fn cmd_stats(db: &Database, format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(SyndicaError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }

    let counts = db.intent_counts().await?;

    if format == "json" {
        let json: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(status, count)| (status.to_string(), serde_json::json!(count)))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::Value::Object(json)).unwrap()
        );
    } else {
        let total: i64 = counts.iter().map(|(_, count)| count).sum();
        for (status, count) in &counts {
            println!("{:12} {}", status.to_string(), count);
        }
        println!("{:12} {}", "total", total);
    }

    Ok(())
}

/// Start an account connection
async fn cmd_connect(db: &Database, config: &Config, user: &str, platform: &str) -> Result<()> {
    let platform = parse_platform(platform)?;
    let manager = handshake_manager(db, config)?;
    let redirect = manager.begin(user, platform).await?;

    println!("Open this URL in a browser to authorize {}:", platform.as_str());
    println!("{}", redirect.url);
    println!();
    println!(
        "Then run: syndica-queue finish --state <STATE> --code <CODE>  (from the redirect URL)"
    );
    Ok(())
}

/// Complete an account connection from the provider redirect
async fn cmd_finish(
    db: &Database,
    config: &Config,
    state: &str,
    code: Option<&str>,
    error: Option<&str>,
) -> Result<()> {
    let callback = match (code, error) {
        (Some(code), None) => Callback::Code(code),
        (None, Some(error)) => Callback::Denied {
            error,
            description: None,
        },
        _ => {
            return Err(SyndicaError::InvalidInput(
                "Provide exactly one of --code or --error".to_string(),
            ))
        }
    };

    let manager = handshake_manager(db, config)?;
    let completed = manager.complete(state, callback).await?;
    println!(
        "Connected {} for user {}",
        completed.platform.as_str(),
        completed.user_id
    );
    Ok(())
}

/// Remove a stored platform connection
async fn cmd_disconnect(db: &Database, config: &Config, user: &str, platform: &str) -> Result<()> {
    let platform = parse_platform(platform)?;
    let vault = Vault::new(config.vault_key()?, db.clone());
    vault.remove(user, platform).await?;
    println!("Disconnected {} for user {}", platform.as_str(), user);
    Ok(())
}

/// Show which platforms a user has connected
async fn cmd_accounts(db: &Database, config: &Config, user: &str) -> Result<()> {
    let vault = Vault::new(config.vault_key()?, db.clone());

    for platform in [PlatformId::Buzzly, PlatformId::Loopd, PlatformId::Pagely] {
        let connected = vault.is_connected(user, platform).await?;
        println!(
            "{:8} {}",
            platform.as_str(),
            if connected { "connected" } else { "-" }
        );
    }
    Ok(())
}
