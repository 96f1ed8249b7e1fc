//! Camera relay monitor
//!
//! Keeps a v4l2loopback device ready with filler frames and runs the real
//! camera pipeline only while something is actually watching.
//!
//! # Usage
//!
//! ```bash
//! # Watch /dev/video10 at 1280x720 with the built-in libcamera pipeline
//! camera-relay-monitor /dev/video10 1280 720
//!
//! # Custom pipeline writing raw YUYV frames to stdout
//! camera-relay-monitor /dev/video10 1280 720 -- my-camera --size={width}x{height}
//!
//! # Who has the device open right now?
//! camera-relay-monitor /dev/video10 --list-openers
//! ```
//!
//! Standard output carries one `READY`, `START` or `STOP` line per
//! lifecycle event; all diagnostics go to standard error.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Camera relay monitor - on-demand v4l2loopback camera pipeline
#[derive(Parser)]
#[command(name = "camera-relay-monitor")]
#[command(version)]
#[command(about = "Start the real camera pipeline only while a v4l2loopback device has clients", long_about = None)]
pub struct Cli {
    /// Loopback device to watch (e.g. /dev/video10)
    #[arg(required_unless_present = "print_config")]
    pub device: Option<PathBuf>,

    /// Output width in pixels (default from config, else 1920)
    pub width: Option<u32>,

    /// Output height in pixels (default from config, else 1080)
    pub height: Option<u32>,

    /// Pipeline command; placeholders {device} {width} {height} {sink}
    #[arg(last = true)]
    pub pipeline: Vec<String>,

    /// Relay mode (relay, yield)
    #[arg(short, long)]
    pub mode: Option<String>,

    /// Do not subscribe to driver events, poll the opener census instead
    #[arg(long)]
    pub no_events: bool,

    /// Config file (default: ~/.config/camera-relay/monitor.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print the PIDs currently holding the device open and exit
    #[arg(long)]
    pub list_openers: bool,

    /// Print a sample configuration file and exit
    #[arg(long)]
    pub print_config: bool,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // stdout is the event protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if cli.print_config {
        return commands::print_config();
    }

    if cli.list_openers {
        return commands::list_openers(&cli);
    }

    commands::run(cli).await
}
