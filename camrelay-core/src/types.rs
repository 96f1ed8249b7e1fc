//! Core types for the relay monitor
//!
//! These types represent the daemon's observable contract with whatever
//! wrapper launched it: the stdout event protocol and the run statistics.

use std::io::Write;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Lifecycle event printed on stdout, one per line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayEvent {
    /// Writer established, device is ready for clients
    Ready,
    /// Idle -> Active: the real pipeline was started
    Start,
    /// Active -> Idle: the real pipeline was stopped
    Stop,
}

impl RelayEvent {
    /// Protocol keyword for this event
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Start => "START",
            Self::Stop => "STOP",
        }
    }
}

impl std::fmt::Display for RelayEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelayEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "READY" => Ok(Self::Ready),
            "START" => Ok(Self::Start),
            "STOP" => Ok(Self::Stop),
            other => Err(format!("Unknown relay event: {}", other)),
        }
    }
}

/// Destination for lifecycle events
pub trait EventSink {
    /// Deliver one event
    fn emit(&mut self, event: RelayEvent);
}

/// Line-buffered stdout protocol writer
#[derive(Debug, Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&mut self, event: RelayEvent) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        // A closed stdout only loses the notification; the relay keeps going.
        if let Err(e) = writeln!(out, "{}", event).and_then(|_| out.flush()) {
            tracing::warn!("Failed to write {} to stdout: {}", event, e);
        }
    }
}

impl EventSink for mpsc::UnboundedSender<RelayEvent> {
    fn emit(&mut self, event: RelayEvent) {
        let _ = self.send(event);
    }
}

impl EventSink for Vec<RelayEvent> {
    fn emit(&mut self, event: RelayEvent) {
        self.push(event);
    }
}

/// Counters accumulated over one monitor run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Completed idle -> active -> idle cycles
    pub cycles: u64,
    /// Connect signals rejected by the census recheck
    pub false_probes: u64,
    /// Pipelines that failed to launch or died while clients were present
    pub pipeline_failures: u64,
    /// Real frames written to the device
    pub frames_relayed: u64,
    /// Filler frames written to the device
    pub fillers_written: u64,
}

impl std::fmt::Display for MonitorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cycles, {} false probes, {} pipeline failures, {} frames relayed, {} fillers",
            self.cycles,
            self.false_probes,
            self.pipeline_failures,
            self.frames_relayed,
            self.fillers_written
        )
    }
}
