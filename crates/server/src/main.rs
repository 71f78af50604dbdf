use std::{env, io, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use courier_core::{Broker, JsonFileStore, NoPersistence, PersistenceAdapter};
use courier_server::{
    auth,
    config::{self, CliOptions},
    http_server::{run_http, AppState},
};
use tracing_subscriber::EnvFilter;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "courierd", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to courier.toml (defaults to $COURIER_CONFIG, then ./courier.toml)
    #[arg(long = "config", value_name = "FILE")]
    config_path: Option<PathBuf>,

    /// Log filter (e.g. info, debug, courier_core=trace)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    /// Host binding
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Port binding
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Path of the action endpoint
    #[arg(long = "endpoint", value_name = "PATH")]
    endpoint: Option<String>,

    /// Caller screening (tokens | agent | any | off)
    #[arg(long = "auth-mode", value_name = "MODE")]
    auth_mode: Option<String>,

    /// Bearer tokens provided via CLI
    #[arg(long = "auth-token", value_name = "TOKEN")]
    auth_tokens: Vec<String>,

    /// Path to JSON file containing authorized tokens
    #[arg(long = "tokens-file", value_name = "FILE")]
    tokens_file: Option<PathBuf>,

    /// Additional CORS allowed origins
    #[arg(long = "cors-origin", value_name = "ORIGIN")]
    cors_origins: Vec<String>,

    /// Snapshot file; enables persistence
    #[arg(long = "snapshot", value_name = "FILE")]
    snapshot_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args);
    tracing::info!(
        "{}",
        courier_build_info::formatted_banner("courierd", SERVER_VERSION)
    );

    let working_dir = env::current_dir().context("Failed to read current directory")?;
    let config_path = config::locate_config(args.config_path.as_deref(), &working_dir);
    if let Some(path) = &config_path {
        tracing::info!("Using config {}", path.display());
    }

    let cli = CliOptions {
        host: args.host.clone(),
        port: args.port,
        endpoint: args.endpoint.clone(),
        auth_mode: args.auth_mode.clone(),
        tokens: args.auth_tokens.clone(),
        tokens_file: args.tokens_file.clone(),
        cors_origins: args.cors_origins.clone(),
        snapshot_path: args.snapshot_path.clone(),
    };

    let file_cfg = config::load_file_config(config_path.as_deref())?;
    let server_config = config::resolve(&cli, file_cfg.as_ref(), &working_dir)?;

    let persistence: Arc<dyn PersistenceAdapter> = match &server_config.persistence {
        Some(persistence) => {
            tracing::info!("Snapshots at {}", persistence.path.display());
            Arc::new(JsonFileStore::new(&persistence.path))
        }
        None => Arc::new(NoPersistence),
    };

    let broker = Broker::new(server_config.broker.clone(), persistence);
    if let Err(err) = broker.restore().await {
        tracing::warn!("Snapshot restore failed, starting empty: {}", err);
    }

    let background = broker.spawn_background();
    let gate = auth::build_gate(&server_config.auth);
    let state = AppState::new(broker.clone(), gate);

    let served = run_http(
        state,
        &server_config.http,
        &server_config.cors,
        shutdown_signal(),
    )
    .await;

    background.shutdown();
    if let Err(err) = broker.persist_now().await {
        tracing::warn!("Final snapshot failed: {}", err);
    }
    tracing::info!("Courier stopped");

    served
}

fn init_tracing(args: &Args) {
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else if let Some(level) = &args.log_level {
        EnvFilter::try_new(level).unwrap_or_else(|_| {
            eprintln!("Warning: Invalid log level '{}', using 'info'", level);
            EnvFilter::new("info")
        })
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    let _ = builder.try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown requested");
}
