//! Configuration file loading and merging
//!
//! Loads user configuration from `~/.config/camera-relay/monitor.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{MonitorConfig, RelayMode, Timing, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::error::{RelayError, Result};

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Output geometry
    #[serde(default)]
    pub device: DeviceSettings,

    /// Relay behaviour
    #[serde(default)]
    pub relay: RelaySettings,

    /// Pipeline command
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Debounce and cadence constants
    #[serde(default)]
    pub timing: TimingSettings,
}

/// Output geometry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
}

/// Relay behaviour settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Relay mode (relay, yield)
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Use driver client-usage events when available
    #[serde(default = "default_true")]
    pub events: bool,

    /// Only inspect processes owned by the same user
    #[serde(default = "default_true")]
    pub same_user_only: bool,

    /// Relay mode: cycle the writer and resubscribe after every STOP
    #[serde(default = "default_true")]
    pub resubscribe_after_cycle: bool,
}

/// Pipeline settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Program and arguments (empty = built-in libcamera pipeline)
    #[serde(default)]
    pub command: Vec<String>,
}

/// Timing settings, all durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_filler_interval_ms")]
    pub filler_interval_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_connect_debounce_ms")]
    pub connect_debounce_ms: u64,

    #[serde(default = "default_departure_tick_ms")]
    pub departure_tick_ms: u64,

    #[serde(default = "default_departure_ticks")]
    pub departure_ticks: u32,

    #[serde(default = "default_no_client_timeout_ms")]
    pub no_client_timeout_ms: u64,

    #[serde(default = "default_handoff_grace_ms")]
    pub handoff_grace_ms: u64,

    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    #[serde(default = "default_reopen_attempts")]
    pub reopen_attempts: u32,

    #[serde(default = "default_reopen_backoff_ms")]
    pub reopen_backoff_ms: u64,
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

fn default_mode() -> String {
    RelayMode::default().to_string()
}

fn default_true() -> bool {
    true
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn default_filler_interval_ms() -> u64 {
    ms(Timing::default().filler_interval)
}

fn default_poll_interval_ms() -> u64 {
    ms(Timing::default().poll_interval)
}

fn default_connect_debounce_ms() -> u64 {
    ms(Timing::default().connect_debounce)
}

fn default_departure_tick_ms() -> u64 {
    ms(Timing::default().departure_tick)
}

fn default_departure_ticks() -> u32 {
    Timing::default().departure_ticks
}

fn default_no_client_timeout_ms() -> u64 {
    ms(Timing::default().no_client_timeout)
}

fn default_handoff_grace_ms() -> u64 {
    ms(Timing::default().handoff_grace)
}

fn default_stop_grace_ms() -> u64 {
    ms(Timing::default().stop_grace)
}

fn default_restart_backoff_ms() -> u64 {
    ms(Timing::default().restart_backoff)
}

fn default_reopen_attempts() -> u32 {
    Timing::default().reopen_attempts
}

fn default_reopen_backoff_ms() -> u64 {
    ms(Timing::default().reopen_backoff)
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            events: true,
            same_user_only: true,
            resubscribe_after_cycle: true,
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self::from(Timing::default())
    }
}

impl From<Timing> for TimingSettings {
    fn from(t: Timing) -> Self {
        Self {
            filler_interval_ms: ms(t.filler_interval),
            poll_interval_ms: ms(t.poll_interval),
            connect_debounce_ms: ms(t.connect_debounce),
            departure_tick_ms: ms(t.departure_tick),
            departure_ticks: t.departure_ticks,
            no_client_timeout_ms: ms(t.no_client_timeout),
            handoff_grace_ms: ms(t.handoff_grace),
            stop_grace_ms: ms(t.stop_grace),
            restart_backoff_ms: ms(t.restart_backoff),
            reopen_attempts: t.reopen_attempts,
            reopen_backoff_ms: ms(t.reopen_backoff),
        }
    }
}

impl From<&TimingSettings> for Timing {
    fn from(s: &TimingSettings) -> Self {
        Self {
            filler_interval: Duration::from_millis(s.filler_interval_ms),
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            connect_debounce: Duration::from_millis(s.connect_debounce_ms),
            departure_tick: Duration::from_millis(s.departure_tick_ms),
            departure_ticks: s.departure_ticks,
            no_client_timeout: Duration::from_millis(s.no_client_timeout_ms),
            handoff_grace: Duration::from_millis(s.handoff_grace_ms),
            stop_grace: Duration::from_millis(s.stop_grace_ms),
            restart_backoff: Duration::from_millis(s.restart_backoff_ms),
            reopen_attempts: s.reopen_attempts,
            reopen_backoff: Duration::from_millis(s.reopen_backoff_ms),
        }
    }
}

impl ConfigFile {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("camera-relay").join("monitor.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("camera-relay")
                .join("monitor.toml")
        } else {
            PathBuf::from("/etc/camera-relay/monitor.toml")
        }
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from a specific path
    ///
    /// A missing file yields the defaults; an unreadable or malformed one
    /// is an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: ConfigFile = toml::from_str(&content)?;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Build a monitor configuration for `device` from the file values
    pub fn to_monitor_config(&self, device: impl Into<PathBuf>) -> Result<MonitorConfig> {
        let mode: RelayMode = self.relay.mode.parse().map_err(RelayError::config)?;

        let mut config = MonitorConfig::new(device)
            .with_resolution(self.device.width, self.device.height)
            .with_mode(mode)
            .with_timing(Timing::from(&self.timing))
            .with_events(self.relay.events)
            .with_same_user_only(self.relay.same_user_only)
            .with_resubscribe_after_cycle(self.relay.resubscribe_after_cycle);

        if !self.pipeline.command.is_empty() {
            config = config.with_command(self.pipeline.command.iter().cloned());
        }

        Ok(config)
    }
}

/// Generate a sample configuration file
pub fn sample_config() -> String {
    r#"# Camera relay monitor configuration
# Command-line arguments override everything in this file.

[device]
# Output resolution written to the loopback device (YUYV, width must be even)
width = 1920
height = 1080

[relay]
# relay: pipeline writes frames to stdout, the monitor copies them (no gap)
# yield: the monitor closes its writer and the pipeline opens the device
mode = "relay"

# Use v4l2loopback client-usage events; falls back to polling if unsupported
events = true

# Only look at processes owned by the current user when counting openers
same_user_only = true

# Reopen the writer and resubscribe after every cycle (stuck-event workaround)
resubscribe_after_cycle = true

[pipeline]
# Program and arguments. Placeholders: {device} {width} {height} {sink}
# Empty = built-in gst-launch-1.0 libcamerasrc pipeline
command = []

[timing]
# Idle filler cadence (also the event wait timeout)
filler_interval_ms = 1000

# Census polling interval when the driver has no events
poll_interval_ms = 2000

# Census recheck delay after a connect signal (rejects probes)
connect_debounce_ms = 600

# Active census interval and how many empty checks end a session
departure_tick_ms = 1000
departure_ticks = 3

# Stop if nobody ever showed up after START
no_client_timeout_ms = 30000

# Yield mode: ignore the census while the pipeline takes the device
handoff_grace_ms = 3000

# SIGTERM -> SIGKILL escalation delay
stop_grace_ms = 3000

# Ignore connect signals this long after a pipeline failure
restart_backoff_ms = 5000

# Writer reacquisition after a cycle
reopen_attempts = 5
reopen_backoff_ms = 1000
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConfigFile::default();
        assert_eq!(config.device.width, 1920);
        assert_eq!(config.relay.mode, "relay");
        assert!(config.pipeline.command.is_empty());
        assert_eq!(Timing::from(&config.timing), Timing::default());
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = sample_config();
        let config: ConfigFile = toml::from_str(&sample).unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_to_monitor_config() {
        let mut file = ConfigFile::default();
        file.relay.mode = "yield".to_string();
        file.relay.events = false;
        file.pipeline.command = vec!["my-pipeline".to_string(), "{device}".to_string()];
        file.timing.departure_ticks = 5;

        let config = file.to_monitor_config("/dev/video42").unwrap();
        assert_eq!(config.device, PathBuf::from("/dev/video42"));
        assert_eq!(config.mode, RelayMode::Yield);
        assert!(!config.use_events);
        assert_eq!(config.timing.departure_ticks, 5);
        assert_eq!(
            config.command,
            Some(vec!["my-pipeline".to_string(), "{device}".to_string()])
        );
    }

    #[test]
    fn test_bad_mode_is_config_error() {
        let mut file = ConfigFile::default();
        file.relay.mode = "teleport".to_string();
        let err = file.to_monitor_config("/dev/video0").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
