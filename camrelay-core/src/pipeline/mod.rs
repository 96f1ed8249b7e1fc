//! Real camera pipeline
//!
//! The pipeline is an opaque external process. In relay mode it writes raw
//! YUYV frames to stdout and the monitor copies them to the device; in
//! yield mode it opens the device itself.

mod child;
mod frames;
mod supervisor;

pub use child::{ChildState, PipelineChild};
pub use frames::FrameReader;
pub use supervisor::PipelineSupervisor;

use std::path::{Path, PathBuf};

use crate::config::{MonitorConfig, RelayMode};
use crate::error::{RelayError, Result};
use crate::formats::FrameFormat;

/// Sink used by relay mode pipelines
pub const STDOUT_SINK: &str = "/dev/stdout";

/// Values substituted into the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    /// `{device}`
    pub device: PathBuf,
    /// `{width}`
    pub width: u32,
    /// `{height}`
    pub height: u32,
    /// `{sink}`: the device in yield mode, stdout in relay mode
    pub sink: String,
}

impl Placeholders {
    /// Placeholder values for a device, format and mode
    pub fn new(device: &Path, format: FrameFormat, mode: RelayMode) -> Self {
        let sink = match mode {
            RelayMode::Relay => STDOUT_SINK.to_string(),
            RelayMode::Yield => device.display().to_string(),
        };
        Self {
            device: device.to_path_buf(),
            width: format.width,
            height: format.height,
            sink,
        }
    }

    fn apply(&self, arg: &str) -> String {
        arg.replace("{device}", &self.device.display().to_string())
            .replace("{width}", &self.width.to_string())
            .replace("{height}", &self.height.to_string())
            .replace("{sink}", &self.sink)
    }
}

/// Program and argument template of the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineCommand {
    program: String,
    args: Vec<String>,
}

impl PipelineCommand {
    /// Command from an argv vector
    pub fn new<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| RelayError::config("Pipeline command cannot be empty"))?;
        Ok(Self {
            program,
            args: argv.collect(),
        })
    }

    /// Built-in libcamera pipeline producing YUY2 at the configured size
    pub fn default_for(mode: RelayMode) -> Self {
        let mut args: Vec<String> = [
            "-q",
            "libcamerasrc",
            "!",
            "video/x-raw,width={width},height={height}",
            "!",
            "videoconvert",
            "!",
            "video/x-raw,format=YUY2,width={width},height={height}",
            "!",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        match mode {
            RelayMode::Relay => args.extend(["fdsink".to_string(), "fd=1".to_string()]),
            RelayMode::Yield => {
                args.extend(["v4l2sink".to_string(), "device={device}".to_string()])
            }
        }

        Self {
            program: "gst-launch-1.0".to_string(),
            args,
        }
    }

    /// Command configured for a monitor, or the built-in one
    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        match &config.command {
            Some(argv) => Self::new(argv.iter().cloned()),
            None => Ok(Self::default_for(config.mode)),
        }
    }

    /// Program name (not substituted)
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments with placeholders substituted
    pub fn render_args(&self, values: &Placeholders) -> Vec<String> {
        self.args.iter().map(|a| values.apply(a)).collect()
    }
}

impl std::fmt::Display for PipelineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
