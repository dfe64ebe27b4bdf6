//! Roadsign Notify CLI - runs the notification sync core headless.
//!
//! This is the main binary entry point. See the `roadsign_notify` library
//! for the core functionality.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use roadsign_notify::{
    display, keyring, Config, Credential, CredentialStore, NotificationClient, SyncSnapshot,
};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "roadsign-notify")]
#[command(version)]
#[command(about = "Realtime notification sync for the road-sign reporting service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected and print notifications until Ctrl-C
    Run,
    /// Store a bearer token
    Login {
        /// Token issued by the reporting service
        #[arg(long)]
        token: String,
    },
    /// Remove the stored bearer token
    Logout,
    /// Connect briefly and print diagnostics as JSON
    Status,
    /// Show or change configuration
    Config {
        /// Config key (e.g. `server_url`)
        key: Option<String>,
        /// New value; prints the current value when omitted
        value: Option<String>,
    },
}

fn init_logging() {
    let environment = roadsign_notify::env::Environment::current();
    let builder_env =
        env_logger::Env::default().default_filter_or(environment.default_log_filter());
    let mut builder = env_logger::Builder::from_env(builder_env);
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("ROADSIGN_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {path}: {e}, logging to stderr"),
        }
    }

    builder.init();
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run()?,
        Commands::Login { token } => {
            let token = token.trim();
            if token.is_empty() {
                anyhow::bail!("Token must not be empty");
            }
            keyring::default_store()?
                .set(&Credential::new(token))
                .context("Failed to store token")?;
            println!("Token saved.");
        }
        Commands::Logout => {
            keyring::default_store()?
                .remove()
                .context("Failed to remove token")?;
            println!("Logged out.");
        }
        Commands::Status => status()?,
        Commands::Config { key, value } => config_command(key, value)?,
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn start_client() -> Result<(Config, NotificationClient)> {
    let config = Config::load()?;
    let credentials: Arc<dyn CredentialStore> = keyring::default_store()?;
    let client = NotificationClient::from_config(&config, credentials)?;
    Ok((config, client))
}

/// Headless mode: print pushes, unread changes and user alerts.
fn run() -> Result<()> {
    runtime()?.block_on(async {
        let (config, mut client) = start_client()?;
        log::info!("Syncing notifications from {}", config.server_url);

        let mut updates = client.subscribe();
        let mut alerts = client
            .take_alert_receiver()
            .context("Alert receiver already taken")?;
        let mut seen: HashSet<i64> = HashSet::new();
        let mut last_unread = None;
        let mut last_connected = None;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!("Shutting down...");
                    break;
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = updates.borrow_and_update().clone();
                    print_changes(&snapshot, &mut seen, &mut last_unread, &mut last_connected);
                }
                Some(alert) = alerts.recv() => {
                    eprintln!("! {}: {}", alert.title, alert.message);
                }
            }
        }

        client.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}

fn print_changes(
    snapshot: &SyncSnapshot,
    seen: &mut HashSet<i64>,
    last_unread: &mut Option<u32>,
    last_connected: &mut Option<bool>,
) {
    let connected = snapshot.is_connected();
    if *last_connected != Some(connected) {
        println!("[{}]", snapshot.connection);
        *last_connected = Some(connected);
    }

    let now = chrono::Utc::now();
    // Oldest first so the terminal reads top to bottom.
    for n in snapshot.notifications.iter().rev() {
        if seen.insert(n.id) {
            println!(
                "{:>9}  [{}] {} - {} ({})",
                display::relative_time(n.created_at, now),
                n.severity,
                n.title,
                n.location,
                n.kind
            );
        }
    }

    if *last_unread != Some(snapshot.unread_count) {
        println!("unread: {}", snapshot.unread_count);
        *last_unread = Some(snapshot.unread_count);
    }
}

/// Wait for the first attempt to settle, then dump diagnostics.
fn status() -> Result<()> {
    runtime()?.block_on(async {
        let config = Config::load()?;
        let credentials: Arc<dyn CredentialStore> = keyring::default_store()?;
        let has_token = credentials.get().context("Failed to read token")?.is_some();
        let client = NotificationClient::from_config(&config, credentials)?;

        if has_token {
            let mut updates = client.subscribe();
            let settle = config.connect_timeout() + Duration::from_secs(1);
            if tokio::time::timeout(settle, updates.wait_for(SyncSnapshot::is_settled))
                .await
                .is_err()
            {
                log::warn!("Connection did not settle within {settle:?}");
            }
        }

        let diagnostics = client.test_connection().await?;
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
        client.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}

fn config_command(key: Option<String>, value: Option<String>) -> Result<()> {
    let config = Config::load()?;
    match (key, value) {
        (None, _) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("effective cable url: {}", config.effective_cable_url());
            println!("environment: {}", roadsign_notify::env::Environment::current());
        }
        (Some(key), None) => {
            if !Config::KEYS.contains(&key.as_str()) {
                anyhow::bail!("Unknown config key '{key}'");
            }
            let json = serde_json::to_value(&config)?;
            println!("{}", json.get(&key).unwrap_or(&serde_json::Value::Null));
        }
        (Some(key), Some(value)) => {
            let updated = config.with_value(&key, &value)?;
            updated.save()?;
            println!("{key} = {value}");
        }
    }
    Ok(())
}
