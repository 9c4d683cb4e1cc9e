use clap::{Parser, Subcommand};
use colored::Colorize;
use offline_sync::{
    HttpProbe, HttpRemoteStore, LocalId, SqliteStorage, SyncConfig, SyncEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "offline-sync")]
#[command(about = "Inspect and replay the offline action queue", long_about = None)]
struct Args {
    /// SQLite file holding the queue and cache (defaults to the user data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show connectivity, queue and cache summary
    Status,

    /// List pending actions in replay order
    Queue {
        /// Only show actions for this resource key
        #[arg(long, short)]
        resource: Option<String>,
    },

    /// List actions that failed permanently
    DeadLetters,

    /// Move a dead letter back onto the queue
    Retry {
        /// Action id, e.g. temp_12
        id: String,
    },

    /// Drop a dead letter for good
    Discard {
        /// Action id, e.g. temp_12
        id: String,
    },

    /// Remove every queued action, dead letter and cached entry
    Clear,

    /// Replay the queue against a server once
    Sync {
        /// Server base URL
        #[arg(long, default_value = "http://localhost:6745")]
        url: String,

        /// Target database
        #[arg(long, short, default_value = "_system")]
        database: String,

        /// Bearer token
        #[arg(long)]
        token: Option<String>,

        /// URL to probe before replaying (confirms connectivity)
        #[arg(long)]
        probe: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "offline_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => SyncConfig::from_toml_file(path)?,
        None => SyncConfig::default(),
    }
    .apply_env()?;

    let storage = match &args.db {
        Some(path) => SqliteStorage::open(path)?,
        None => SqliteStorage::open_default("offline-sync")?,
    };
    let storage = Arc::new(storage);

    match args.command {
        Command::Sync {
            url,
            database,
            token,
            probe,
        } => {
            let mut remote = HttpRemoteStore::new(&url, &database)?.with_id_field(&config.id_field);
            if let Some(token) = &token {
                remote = remote.with_token(token);
            }

            let mut builder = SyncEngine::builder(Arc::new(remote), storage).config(config.clone());
            if let Some(probe_url) = &probe {
                let probe = HttpProbe::new(probe_url, config.connectivity.probe_timeout())?;
                builder = builder.probe(Arc::new(probe));
            }
            let engine = builder.build()?;

            if probe.is_some() {
                let state = engine.check_connectivity().await;
                if !state.is_online {
                    println!("{} Server unreachable, nothing replayed", "✗".red());
                    return Ok(());
                }
            }

            let queued = engine.status().queued_actions;
            if queued == 0 {
                println!("{} Queue is empty", "•".dimmed());
                return Ok(());
            }

            println!("Replaying {} action(s) against {}", queued, url.cyan());
            let report = engine.sync_now().await;
            println!(
                "{} {} succeeded, {} retried, {} dead-lettered, {} conflicts",
                "✓".green(),
                report.succeeded.to_string().green(),
                report.retried.to_string().yellow(),
                report.dead_lettered.to_string().red(),
                report.conflicts.to_string().red()
            );
            if report.skipped_blocked > 0 {
                println!(
                    "{} {} resource(s) still blocked (backoff or pending dependency)",
                    "!".yellow(),
                    report.skipped_blocked
                );
            }
        }
        command => {
            // Local commands never reach the network
            let remote = HttpRemoteStore::new("http://localhost:6745", "_system")?;
            let engine = SyncEngine::builder(Arc::new(remote), storage)
                .config(config)
                .build()?;
            run_local(&engine, command)?;
        }
    }

    Ok(())
}

fn run_local(engine: &SyncEngine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            let status = engine.status();
            let last_sync = status
                .last_sync_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());

            println!("{}", "Offline sync status".bold());
            println!("  Last sync:       {}", last_sync);
            println!("  Queued actions:  {}", status.queued_actions);
            if status.dead_letters > 0 {
                println!("  Dead letters:    {}", status.dead_letters.to_string().red());
            } else {
                println!("  Dead letters:    0");
            }
            println!(
                "  Cache:           {} entries ({})",
                status.cache_entries, status.cache_size
            );
            if status.storage_degraded {
                println!("  {} Storage is degraded, changes are not persisted", "!".yellow());
            }
        }

        Command::Queue { resource } => {
            let actions: Vec<_> = engine
                .pending_actions()
                .into_iter()
                .filter(|a| resource.as_deref().map_or(true, |r| a.resource_key == r))
                .collect();

            if actions.is_empty() {
                println!("{} No pending actions", "•".dimmed());
                return Ok(());
            }
            for action in actions {
                let target = action
                    .target()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let mut line = format!(
                    "{} {:<16} {:<7} {:<12} attempts={}",
                    format!("{:<10}", action.id).cyan(),
                    action.resource_key,
                    action.kind().to_string(),
                    target,
                    action.attempts
                );
                if let Some(err) = &action.last_error {
                    line.push_str(&format!(" last_error={}", err.yellow()));
                }
                println!("{}", line);
            }
        }

        Command::DeadLetters => {
            let letters = engine.dead_letters();
            if letters.is_empty() {
                println!("{} No dead letters", "•".dimmed());
                return Ok(());
            }
            for letter in letters {
                println!(
                    "{} {:<16} {:<7} {} ({})",
                    format!("{:<10}", letter.action.id).red(),
                    letter.action.resource_key,
                    letter.action.kind().to_string(),
                    letter.reason,
                    letter.dead_lettered_at.to_rfc3339()
                );
            }
        }

        Command::Retry { id } => {
            let id = parse_id(&id)?;
            engine.retry_dead_letter(&id)?;
            println!("{} {} moved back to the queue", "✓".green(), id);
        }

        Command::Discard { id } => {
            let id = parse_id(&id)?;
            engine.discard_dead_letter(&id)?;
            println!("{} {} discarded", "✓".green(), id);
        }

        Command::Clear => {
            engine.clear_all();
            println!("{} Offline data cleared", "✓".green());
        }

        Command::Sync { .. } => anyhow::bail!("sync needs a remote store"),
    }

    Ok(())
}

fn parse_id(raw: &str) -> anyhow::Result<LocalId> {
    LocalId::parse(raw).ok_or_else(|| anyhow::anyhow!("'{}' is not a local action id", raw))
}
