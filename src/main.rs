pub mod config;
pub mod engine;
pub mod launcher;
pub mod native;
pub mod shutdown;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::Overrides;
use crate::engine::server::{self, AppState};
use crate::launcher::ScriptMonitor;

#[derive(Parser)]
#[command(
    name = "scriptd",
    version,
    about = "Run a startup script and serve a landing page plus a subscription file over HTTP"
)]
struct Cli {
    /// Path to scriptd.toml (defaults to ./scriptd.toml when present)
    #[arg(long, env = "SCRIPTD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the HTTP listener to
    #[arg(long, env = "SCRIPTD_BIND")]
    bind: Option<String>,

    /// HTTP listen port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Script to make executable and run at startup
    #[arg(long, env = "SCRIPTD_SCRIPT")]
    script: Option<PathBuf>,

    /// Text file served on GET /sub
    #[arg(long, env = "SCRIPTD_SUB_PATH")]
    sub_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("scriptd=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref())?;
    config.apply_overrides(Overrides {
        bind: cli.bind,
        port: cli.port,
        script: cli.script,
        sub_path: cli.sub_path,
    });

    tracing::info!(
        script = %config.script.path.display(),
        subscription = %config.files.subscription.display(),
        "Starting scriptd"
    );

    let monitor = Arc::new(ScriptMonitor::new(
        &config.script.label(),
        config.script.log_capacity,
    ));
    let launch = launcher::launch(config.script.clone(), Arc::clone(&monitor));

    let bind_addr = config.bind_addr();
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            launch.shutdown().await;
            return Err(e).with_context(|| format!("Failed to bind {}", bind_addr));
        }
    };

    let state = Arc::new(AppState {
        landing_message: config.server.landing_message.clone(),
        subscription_path: config.files.subscription.clone(),
        monitor,
    });
    let app = server::router(state);

    tracing::info!("HTTP server listening on http://{}", bind_addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await;
    tracing::info!("HTTP server closed");

    launch.shutdown().await;
    served.context("HTTP server failed")
}
