//! Camera Relay Core Library
//!
//! On-demand relay between a real camera pipeline and a v4l2loopback
//! device.
//!
//! This library provides:
//! - An opener census over `/proc` (who holds the virtual device open)
//! - The loopback writer that keeps the device ready with filler frames
//! - Client-usage event negotiation for both v4l2loopback generations
//! - A supervisor for the real pipeline subprocess
//! - The idle/active state machine tying them together
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐    ┌──────────────┐    ┌─────────────────┐
//! │ Opener Census │───▶│   Monitor    │◀──▶│  Loopback dev   │
//! │ (/proc/*/fd)  │    │ (Idle/Active)│    │ (writer+events) │
//! └───────────────┘    └──────┬───────┘    └─────────────────┘
//!                             │ start/stop        ▲ frames
//!                      ┌──────▼───────┐           │
//!                      │   Pipeline   │───────────┘
//!                      │ (subprocess) │
//!                      └──────────────┘
//! ```

pub mod census;
pub mod config;
pub mod device;
pub mod error;
pub mod formats;
pub mod monitor;
pub mod pipeline;
pub mod shutdown;
pub mod types;

pub use config::{MonitorConfig, RelayMode, Timing};
pub use error::{RelayError, Result};
pub use monitor::Monitor;
pub use types::{EventSink, MonitorStats, RelayEvent, StdoutSink};
