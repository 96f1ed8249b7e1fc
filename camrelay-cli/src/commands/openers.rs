//! List the processes holding the device open

use anyhow::{Context, Result};
use camrelay_core::census::{CensusProvider, Exclusions, ProcCensus};

use crate::Cli;

/// Print one PID per line
pub fn list_openers(cli: &Cli) -> Result<()> {
    let device = cli
        .device
        .as_ref()
        .context("A loopback device path is required")?;

    let census = ProcCensus::new(device);
    let openers = census.openers(&Exclusions::own_process());

    tracing::debug!(
        "{} opener(s) of {}",
        openers.len(),
        census.device().display()
    );

    for pid in openers {
        println!("{}", pid);
    }

    Ok(())
}
