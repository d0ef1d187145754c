//! BMC fleet operator
//!
//! Keeps local BMC records and a Redfish aggregation service in sync.
//!
//! ## Architecture
//!
//! - **Poll Scheduler**: full pass over the fleet on a fixed interval
//! - **Event Listener**: runs the pass for one BMC when the service reports a change
//! - **Fleet**: one actor per BMC record, so passes for a BMC never overlap

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bmcsync_operator::config::Config;
use bmcsync_operator::crypto::PasswordCipher;
use bmcsync_operator::engine::ReconcileContext;
use bmcsync_operator::events::{self, EventDispatcher};
use bmcsync_operator::redfish::{HttpConnector, HttpRedfishClient};
use bmcsync_operator::state::SqliteStore;
use bmcsync_operator::task_monitor::TaskMonitor;
use bmcsync_operator::{Fleet, PollScheduler};

#[derive(Parser)]
#[command(name = "bmc-operator", version, about = "BMC fleet operator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the operator (default).
    Run,

    /// Encrypt a password read from stdin for storing in a BMC record.
    EncryptPassword {
        /// Public key PEM; defaults to BMC_PUBLIC_KEY_PATH.
        #[arg(long, env = "BMC_PUBLIC_KEY_PATH", default_value = "/etc/bmc-operator/keys/public.pem")]
        public_key: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::EncryptPassword { public_key } => encrypt_password(&public_key),
    }
}

fn encrypt_password(public_key: &std::path::Path) -> Result<()> {
    let cipher = PasswordCipher::load_public(public_key)
        .with_context(|| format!("loading {}", public_key.display()))?;

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let password = input.trim_end_matches(['\r', '\n']);
    anyhow::ensure!(!password.is_empty(), "no password on stdin");

    println!("{}", cipher.encrypt(password)?);
    Ok(())
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to BMC_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting BMC operator");
    info!(
        aggregator_url = %config.aggregator_url,
        policy = %config.policy,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    let api = Arc::new(HttpRedfishClient::new(config.client_settings())?);
    let connector = Arc::new(HttpConnector::new(
        config.insecure_skip_verify,
        Duration::from_secs(30),
    ));

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let store = Arc::new(SqliteStore::open(config.records_db_path())?);

    let cipher = Arc::new(
        PasswordCipher::load_private(&config.private_key_path)
            .with_context(|| format!("loading {}", config.private_key_path.display()))?,
    );
    let monitor = TaskMonitor::new(config.task_retry_count, config.task_retry_interval);

    let ctx = Arc::new(ReconcileContext::new(
        api,
        store,
        connector,
        cipher,
        monitor,
        config.engine_settings(),
    ));
    let fleet = Arc::new(Fleet::new(ctx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the poll scheduler
    let scheduler = PollScheduler::new(Arc::clone(&fleet), config.poll_interval);
    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler.run(shutdown_rx).await;
        }
    });

    // Start the event listener
    let listener = tokio::net::TcpListener::bind(&config.event_listen_addr).await?;
    info!(addr = %config.event_listen_addr, "Listening for events");
    let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&fleet)));
    let mut server_handle = tokio::spawn(events::serve(listener, dispatcher, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Event listener exited"),
                Ok(Err(e)) => error!(error = %e, "Event listener error"),
                Err(e) => error!(error = %e, "Event listener task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, scheduler_handle).await {
        warn!(error = %e, "Poll scheduler did not shut down in time");
    }
    if !server_handle.is_finished() {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, server_handle).await {
            warn!(error = %e, "Event listener did not shut down in time");
        }
    }

    fleet.stop_all().await;

    info!("BMC operator shutdown complete");
    Ok(())
}
