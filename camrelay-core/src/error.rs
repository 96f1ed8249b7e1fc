//! Error types for camera-relay

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for relay monitor operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// The loopback device could not be opened for writing
    #[error("Cannot open {}: {source}", path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Loopback device error after the handle was acquired
    #[error("Device error: {0}")]
    Device(String),

    /// Pipeline subprocess error
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<RelayError>,
    },
}

impl RelayError {
    /// Create a device open error
    pub fn device_open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DeviceOpen {
            path: path.into(),
            source,
        }
    }

    /// Create a device error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create a pipeline error
    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error means the daemon cannot start (or keep) its
    /// writer handle at all.
    ///
    /// Everything else is degraded around by the monitor loop.
    pub fn is_setup_failure(&self) -> bool {
        match self {
            Self::DeviceOpen { .. } | Self::Config(_) => true,
            Self::WithContext { source, .. } => source.is_setup_failure(),
            _ => false,
        }
    }

    /// Get a user-facing hint for resolving this error
    pub fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::DeviceOpen { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => {
                    Some("Is the v4l2loopback module loaded? Try: sudo modprobe v4l2loopback")
                }
                std::io::ErrorKind::PermissionDenied => {
                    Some("Add your user to the 'video' group or fix the device permissions")
                }
                _ => None,
            },
            Self::Config(_) => Some("Check the config file with: camera-relay-monitor --print-config"),
            Self::WithContext { source, .. } => source.user_hint(),
            _ => None,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("Failed to parse config file: {}", err))
    }
}
