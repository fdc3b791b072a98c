use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::{info, warn};

use mqtt2cmd::config::{AppConfig, Cli};
use mqtt2cmd::controls::{Executor, ShellExecutor};
use mqtt2cmd::engine::Session;
use mqtt2cmd::logging;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let cli = Cli::parse();
    let config = AppConfig::load(&cli).wrap_err("Failed to load configuration")?;
    let _log_guard = logging::init(&config.log).wrap_err("Failed to initialise logging")?;

    info!(
        pid = std::process::id(),
        config_file = ?config.source,
        switches = config.switches.len(),
        "Application started"
    );

    let executor: Arc<dyn Executor> = Arc::new(ShellExecutor::default());
    let session = Session::connect(&config, executor)
        .await
        .wrap_err("Failed to connect to MQTT broker")?;
    let session = session
        .start()
        .await
        .wrap_err("Failed to subscribe to switch command topics")?;

    session
        .run_until_shutdown(config.refresh_interval, ctrl_c())
        .await;

    session
        .shutdown()
        .await
        .wrap_err("Failed to disconnect from MQTT broker")?;
    info!("Application stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// Resolves on Ctrl-C. Never resolves if the listener cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C, running until killed: {}", e);
        std::future::pending::<()>().await;
    }
}
