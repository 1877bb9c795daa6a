use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, EnvConfig};
use crate::router::{build_router, AppState};
use crate::sandbox;
use crate::store::ConfigStore;

const DEFAULT_HOST: &str = "0.0.0.0";

#[derive(Parser, Debug)]
#[command(name = "agent-gateway", bin_name = "agent-gateway")]
#[command(about = "Self-hosted web gateway for an agentic coding assistant")]
#[command(version, arg_required_else_help = true)]
pub struct GatewayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway HTTP/WebSocket server.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    /// Overrides the PORT environment variable.
    #[arg(long, short = 'p')]
    port: Option<u16>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_gateway() -> Result<(), CliError> {
    let cli = GatewayCli::parse();
    init_logging();
    match cli.command {
        Command::Serve(args) => run_serve(&args),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_serve(args: &ServeArgs) -> Result<(), CliError> {
    let mut config = match EnvConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing(names)) => {
            eprintln!("missing required environment variables:");
            for name in names {
                eprintln!("  {name}");
            }
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    std::fs::create_dir_all(&config.data_dir)?;
    if let Some(container) = &config.sandbox_container {
        sandbox::install_default_wrapper(&config.wrapper_path, container)?;
    }

    let store = ConfigStore::open(&config.data_dir.join("gateway.db"))
        .map_err(|err| CliError::Server(err.to_string()))?;
    let addr = format!("{}:{}", args.host, config.port);
    let state = Arc::new(
        AppState::new(config, store).map_err(|err| CliError::Server(err.to_string()))?,
    );
    let router = build_router(state);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "gateway listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}
