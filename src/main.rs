#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use duocast::config::Config;
use duocast::coordinator::{CorrelationKey, SnapshotStore, SqliteSnapshotStore};
use duocast::store::SqliteMessageRecordStore;
use duocast::timers::SqliteTimerService;
use duocast::ConfigCommands;
use tracing_subscriber::{fmt, EnvFilter};

/// `duocast` - one notification per stream, across Twitch and Kick.
#[derive(Parser, Debug)]
#[command(name = "duocast")]
#[command(version)]
#[command(about = "Merges Twitch and Kick go-live events into one Discord notification.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the long-running daemon (webhook gateway + timer scheduler)
    #[command(long_about = "\
Start the long-running daemon.

Runs the webhook gateway and the durable timer scheduler under a supervisor \
that restarts either one with exponential backoff. Armed wait windows are \
recovered from the state database on startup.

Examples:
  duocast daemon
  duocast daemon --port 8080
  duocast daemon --host 0.0.0.0")]
    Daemon {
        /// Gateway bind address (defaults to [gateway].host)
        #[arg(long)]
        host: Option<String>,

        /// Gateway port (defaults to [gateway].port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show configuration and the last daemon health snapshot
    Status,

    /// List armed wait-window timers
    Timers,

    /// Inspect the persisted actor for a correlation key (`name@destination`)
    Actor {
        /// Correlation key, e.g. `somestreamer@123456789`
        key: String,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("DUOCAST_CONFIG_DIR", config_dir);
    }

    // Respects RUST_LOG, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Daemon { host, port } => {
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            duocast::daemon::run(config, host, port).await
        }

        Commands::Status => print_status(&config),

        Commands::Timers => {
            let timers = SqliteTimerService::new(config.state_db_path()).list()?;
            if timers.is_empty() {
                println!("No armed timers.");
                return Ok(());
            }
            for (key, fire_at) in timers {
                println!("{key}  fires {}", fire_at.to_rfc3339());
            }
            Ok(())
        }

        Commands::Actor { key } => {
            let key = CorrelationKey::parse(&key)?;
            let db_path = config.state_db_path();
            let snapshot = SqliteSnapshotStore::new(&db_path)
                .load(&key)?
                .unwrap_or_default();
            let records = SqliteMessageRecordStore::new(&db_path).list_for_key(&key)?;
            let body = serde_json::json!({
                "key": key,
                "snapshot": snapshot,
                "records": records,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }

        Commands::Config { config_command } => match config_command {
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                println!("{}", serde_json::to_string_pretty(&schema)?);
                Ok(())
            }
        },
    }
}

fn print_status(config: &Config) -> Result<()> {
    println!("duocast status");
    println!();
    println!("Version:     {}", env!("CARGO_PKG_VERSION"));
    println!("Workspace:   {}", config.workspace_dir.display());
    println!("Config:      {}", config.config_path.display());
    println!("State db:    {}", config.state_db_path().display());
    println!();
    println!("Gateway:     {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "Webhook secret: {}",
        if config.gateway.webhook_secret.is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!("Wait window: {}s", config.coordinator.wait_window_secs);
    println!(
        "Discord:     {}",
        if config.discord.bot_token.is_some() {
            "token configured"
        } else {
            "no bot token"
        }
    );
    println!();

    let state_path = duocast::daemon::state_file_path(config);
    match std::fs::read_to_string(&state_path) {
        Ok(raw) => {
            let state: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", state_path.display()))?;
            println!(
                "Daemon state (written {}):",
                state["written_at"].as_str().unwrap_or("unknown")
            );
            if let Some(components) = state["components"].as_object() {
                for (name, component) in components {
                    let status = component["status"].as_str().unwrap_or("unknown");
                    let restarts = component["restart_count"].as_u64().unwrap_or(0);
                    match component["last_error"].as_str() {
                        Some(err) if status != "ok" => {
                            println!("  {name:<10} {status} (restarts: {restarts}, last error: {err})");
                        }
                        _ => println!("  {name:<10} {status} (restarts: {restarts})"),
                    }
                }
            }
        }
        Err(_) => println!("Daemon state: not running (no {})", state_path.display()),
    }
    Ok(())
}
