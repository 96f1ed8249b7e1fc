//! Run the monitor until SIGTERM or SIGINT

use anyhow::{Context, Result};
use camrelay_core::shutdown;
use camrelay_core::{Monitor, RelayError};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use super::load_config;
use crate::Cli;

/// Start the monitor and block until an orderly shutdown
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let monitor = Monitor::for_device(config).map_err(report)?;

    let (trigger, shutdown) = shutdown::channel();
    let monitor = monitor.run(shutdown);
    tokio::pin!(monitor);

    // Signals only raise the flag; the monitor finishes its own teardown.
    let result = loop {
        tokio::select! {
            result = &mut monitor => break result,
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                trigger.trigger();
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                trigger.trigger();
            }
        }
    };

    let stats = result.map_err(report)?;
    info!("Exiting: {}", stats);
    Ok(())
}

fn report(e: RelayError) -> anyhow::Error {
    if let Some(hint) = e.user_hint() {
        error!("{}", hint);
    }
    e.into()
}
