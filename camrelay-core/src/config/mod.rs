//! Configuration types for the relay monitor
//!
//! Provides the relay mode, the tuned debounce/cadence constants and the
//! complete runtime configuration handed to the monitor.

mod file;

pub use file::{sample_config, ConfigFile};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::formats::FrameFormat;

/// Default output width
pub const DEFAULT_WIDTH: u32 = 1920;
/// Default output height
pub const DEFAULT_HEIGHT: u32 = 1080;
/// Upper bound for any single timing value
pub const MAX_TIMING: Duration = Duration::from_secs(24 * 60 * 60);

/// How the real pipeline gets its frames onto the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Pipeline writes raw frames to a pipe; the monitor keeps its writer
    /// open and copies them to the device (no readiness gap)
    #[default]
    Relay,
    /// Monitor closes its writer at START and the pipeline opens the device
    /// itself; the writer is reacquired after STOP
    Yield,
}

impl RelayMode {
    /// Whether the monitor gives up the writer while active
    pub fn yields_writer(&self) -> bool {
        matches!(self, Self::Yield)
    }
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Relay => write!(f, "relay"),
            Self::Yield => write!(f, "yield"),
        }
    }
}

impl std::str::FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relay" | "pipe" => Ok(Self::Relay),
            "yield" | "handoff" => Ok(Self::Yield),
            _ => Err(format!("Unknown relay mode: {}", s)),
        }
    }
}

/// Debounce thresholds and loop cadences
///
/// These are empirically tuned against real hardware and consumer apps;
/// every one of them can be overridden from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Idle filler cadence, also the event-wait timeout
    pub filler_interval: Duration,
    /// Idle census polling interval when the driver has no events
    pub poll_interval: Duration,
    /// Delay before re-checking the census after a connect signal
    pub connect_debounce: Duration,
    /// Census interval while active
    pub departure_tick: Duration,
    /// Consecutive zero-client ticks before STOP
    pub departure_ticks: u32,
    /// STOP if no client ever showed up after START
    pub no_client_timeout: Duration,
    /// Yield mode: census is ignored while the pipeline opens the device
    pub handoff_grace: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: Duration,
    /// Connect signals are ignored this long after a pipeline failure
    pub restart_backoff: Duration,
    /// Attempts to reacquire the writer after a cycle
    pub reopen_attempts: u32,
    /// Delay between reacquisition attempts
    pub reopen_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            filler_interval: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(2000),
            connect_debounce: Duration::from_millis(600),
            departure_tick: Duration::from_millis(1000),
            departure_ticks: 3,
            no_client_timeout: Duration::from_secs(30),
            handoff_grace: Duration::from_millis(3000),
            stop_grace: Duration::from_millis(3000),
            restart_backoff: Duration::from_millis(5000),
            reopen_attempts: 5,
            reopen_backoff: Duration::from_millis(1000),
        }
    }
}

impl Timing {
    /// How long a departure has to last before STOP
    pub fn departure_window(&self) -> Duration {
        self.departure_tick
            .checked_mul(self.departure_ticks)
            .unwrap_or(Duration::MAX)
    }

    fn durations(&self) -> [(&'static str, Duration); 9] {
        [
            ("filler_interval", self.filler_interval),
            ("poll_interval", self.poll_interval),
            ("connect_debounce", self.connect_debounce),
            ("departure_tick", self.departure_tick),
            ("no_client_timeout", self.no_client_timeout),
            ("handoff_grace", self.handoff_grace),
            ("stop_grace", self.stop_grace),
            ("restart_backoff", self.restart_backoff),
            ("reopen_backoff", self.reopen_backoff),
        ]
    }
}

/// Complete monitor configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Loopback device path (e.g. /dev/video10)
    pub device: PathBuf,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Relay or yield variant
    pub mode: RelayMode,
    /// Pipeline command; `None` uses the built-in libcamera pipeline
    pub command: Option<Vec<String>>,
    /// Debounce and cadence constants
    pub timing: Timing,
    /// Try driver client-usage events before falling back to polling
    pub use_events: bool,
    /// Only inspect processes owned by the same user
    pub same_user_only: bool,
    /// Relay mode: cycle the writer and resubscribe after every STOP
    pub resubscribe_after_cycle: bool,
}

impl MonitorConfig {
    /// Create a config for a device with default settings
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            mode: RelayMode::default(),
            command: None,
            timing: Timing::default(),
            use_events: true,
            same_user_only: true,
            resubscribe_after_cycle: true,
        }
    }

    /// Set the output resolution
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the relay mode
    pub fn with_mode(mut self, mode: RelayMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set an explicit pipeline command
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the timing constants
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Enable or disable driver events
    pub fn with_events(mut self, enabled: bool) -> Self {
        self.use_events = enabled;
        self
    }

    /// Restrict the census to processes of the same user
    pub fn with_same_user_only(mut self, enabled: bool) -> Self {
        self.same_user_only = enabled;
        self
    }

    /// Cycle the writer after every STOP in relay mode
    pub fn with_resubscribe_after_cycle(mut self, enabled: bool) -> Self {
        self.resubscribe_after_cycle = enabled;
        self
    }

    /// Output frame format
    pub fn frame_format(&self) -> Result<FrameFormat> {
        FrameFormat::new(self.width, self.height)
    }

    /// Validate the configuration and return any warnings
    ///
    /// An empty list means the configuration looks good.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let t = &self.timing;

        if t.filler_interval > Duration::from_secs(2) {
            warnings.push(format!(
                "Filler interval {:?} is long; some clients drop a device that stalls for more than 2s",
                t.filler_interval
            ));
        }

        if t.connect_debounce >= t.poll_interval {
            warnings.push(format!(
                "Connect debounce {:?} is not shorter than the poll interval {:?}",
                t.connect_debounce, t.poll_interval
            ));
        }

        if t.no_client_timeout <= t.departure_window() {
            warnings.push(format!(
                "No-client timeout {:?} is shorter than the departure window {:?}",
                t.no_client_timeout,
                t.departure_window()
            ));
        }

        if t.stop_grace < Duration::from_millis(500) {
            warnings.push(format!(
                "Stop grace {:?} gives the pipeline little time to release the camera",
                t.stop_grace
            ));
        }

        if self.mode == RelayMode::Yield && t.handoff_grace < t.departure_tick {
            warnings.push(
                "Handoff grace is shorter than one departure tick; the pipeline's own handle may be counted"
                    .to_string(),
            );
        }

        warnings
    }

    /// Validate and return an error if configuration is invalid
    ///
    /// Unlike `validate()` which returns warnings, this returns hard errors
    /// for configurations that cannot work.
    pub fn validate_strict(&self) -> std::result::Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("Resolution cannot be zero".to_string());
        }

        if self.width % 2 != 0 {
            return Err(format!(
                "Width {} must be even (YUYV packs two pixels per macropixel)",
                self.width
            ));
        }

        if self.width > 7680 || self.height > 4320 {
            return Err(format!(
                "Resolution {}x{} exceeds maximum supported (7680x4320)",
                self.width, self.height
            ));
        }

        if let Some(command) = &self.command {
            match command.first() {
                None => return Err("Pipeline command cannot be empty".to_string()),
                Some(program) if program.trim().is_empty() => {
                    return Err("Pipeline program name cannot be blank".to_string())
                }
                Some(_) => {}
            }
        }

        if self.timing.departure_ticks == 0 {
            return Err("departure_ticks must be at least 1".to_string());
        }

        if self.timing.reopen_attempts == 0 {
            return Err("reopen_attempts must be at least 1".to_string());
        }

        if self.timing.filler_interval.is_zero()
            || self.timing.poll_interval.is_zero()
            || self.timing.departure_tick.is_zero()
        {
            return Err("Loop intervals cannot be zero".to_string());
        }

        for (name, value) in self.timing.durations() {
            if value > MAX_TIMING {
                return Err(format!(
                    "{} of {:?} exceeds the {:?} limit",
                    name, value, MAX_TIMING
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::new("/dev/video10");
        assert_eq!(config.width, 1920);
        assert_eq!(config.height, 1080);
        assert_eq!(config.mode, RelayMode::Relay);
        assert!(config.use_events);
        assert!(config.validate_strict().is_ok());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("relay".parse::<RelayMode>().unwrap(), RelayMode::Relay);
        assert_eq!("Yield".parse::<RelayMode>().unwrap(), RelayMode::Yield);
        assert!("bogus".parse::<RelayMode>().is_err());
        assert!(RelayMode::Yield.yields_writer());
        assert!(!RelayMode::Relay.yields_writer());
    }

    #[test]
    fn test_strict_rejects_bad_geometry() {
        let odd = MonitorConfig::new("/dev/video10").with_resolution(1281, 720);
        assert!(odd.validate_strict().is_err());

        let huge = MonitorConfig::new("/dev/video10").with_resolution(8192, 4320);
        assert!(huge.validate_strict().is_err());
    }

    #[test]
    fn test_strict_rejects_empty_command() {
        let empty = MonitorConfig::new("/dev/video10").with_command(Vec::<String>::new());
        assert!(empty.validate_strict().is_err());

        let blank = MonitorConfig::new("/dev/video10").with_command(["  "]);
        assert!(blank.validate_strict().is_err());
    }

    #[test]
    fn test_departure_window() {
        let timing = Timing::default();
        assert_eq!(timing.departure_window(), Duration::from_secs(3));

        let saturated = Timing {
            departure_tick: Duration::from_secs(u64::MAX / 2),
            departure_ticks: 3,
            ..Timing::default()
        };
        assert_eq!(saturated.departure_window(), Duration::MAX);
    }

    #[test]
    fn test_strict_rejects_zero_poll_interval() {
        let mut config = MonitorConfig::new("/dev/video10");
        config.timing.poll_interval = Duration::ZERO;
        let err = config.validate_strict().unwrap_err();
        assert!(err.contains("zero"));
    }

    #[test]
    fn test_strict_rejects_oversized_timing() {
        let mut config = MonitorConfig::new("/dev/video10");
        config.timing.restart_backoff = MAX_TIMING + Duration::from_millis(1);
        let err = config.validate_strict().unwrap_err();
        assert!(err.contains("restart_backoff"));

        let mut config = MonitorConfig::new("/dev/video10");
        config.timing.stop_grace = MAX_TIMING;
        assert!(config.validate_strict().is_ok());
    }
}
