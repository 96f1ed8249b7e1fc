//! Loopback device access
//!
//! [`Loopback`] is everything the monitor needs from the virtual device:
//! the writer lifecycle, frame writes and client-usage events.
//! [`V4l2Loopback`] is the real v4l2loopback implementation.

mod events;
mod ioctl;
mod writer;

pub use events::{
    ClientSignal, ClientUsageEvent, EventScheme, LEGACY_EVENT_TYPE, MODERN_EVENT_TYPE,
};
pub use ioctl::{VIDIOC_DQEVENT, VIDIOC_SUBSCRIBE_EVENT};
pub use writer::DeviceWriter;

use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;

use crate::error::Result;
use crate::formats::FrameFormat;

/// Virtual device as seen by the monitor
pub trait Loopback {
    /// Open the writer, declare the format and write a first filler frame
    fn open_writer(&mut self) -> Result<()>;

    /// Release the writer (and any event subscription with it)
    fn close_writer(&mut self);

    /// Whether the writer is currently held
    fn is_writer_open(&self) -> bool;

    /// Write one filler frame
    fn write_filler(&mut self) -> io::Result<()>;

    /// Write one real frame
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Subscribe to the client-usage event of `scheme`
    fn subscribe(&mut self, scheme: EventScheme) -> io::Result<()>;

    /// Wait up to `timeout` for the next client-usage event
    ///
    /// `Ok(None)` means the timeout elapsed. Must be cancel safe.
    fn wait_for_event(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Option<ClientUsageEvent>>>;
}

/// Borrowed descriptor registered with the reactor
///
/// Does not own the fd; the [`DeviceWriter`] does.
#[derive(Debug)]
struct DeviceFd(RawFd);

impl AsRawFd for DeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// v4l2loopback output device
#[derive(Debug)]
pub struct V4l2Loopback {
    writer: DeviceWriter,
    /// Event readiness (EPOLLPRI), present once subscribed
    events: Option<AsyncFd<DeviceFd>>,
}

impl V4l2Loopback {
    /// Create a loopback handle for `path`; nothing is opened yet
    pub fn new(path: impl Into<PathBuf>, format: FrameFormat) -> Result<Self> {
        Ok(Self {
            writer: DeviceWriter::new(path, format)?,
            events: None,
        })
    }
}

impl Loopback for V4l2Loopback {
    fn open_writer(&mut self) -> Result<()> {
        self.writer.open()
    }

    fn close_writer(&mut self) {
        // Deregister before the descriptor goes away.
        self.events = None;
        self.writer.close();
    }

    fn is_writer_open(&self) -> bool {
        self.writer.is_open()
    }

    fn write_filler(&mut self) -> io::Result<()> {
        self.writer.write_filler()
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_frame(frame)
    }

    fn subscribe(&mut self, scheme: EventScheme) -> io::Result<()> {
        let Some(event_type) = scheme.event_type() else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "polling has no event subscription",
            ));
        };
        let fd = self
            .writer
            .raw_fd()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "writer closed"))?;

        ioctl::subscribe_event(fd, event_type)?;
        debug!("Subscribed to event type {:#x}", event_type);

        if self.events.is_none() {
            self.events = Some(AsyncFd::with_interest(DeviceFd(fd), Interest::PRIORITY)?);
        }
        Ok(())
    }

    async fn wait_for_event(&mut self, timeout: Duration) -> io::Result<Option<ClientUsageEvent>> {
        let events = self
            .events
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not subscribed"))?;

        // Anything queued before the last readiness edge
        match ioctl::dequeue_event(events.get_ref().0) {
            Ok(event) => return Ok(Some(event)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let wait = async {
            loop {
                let mut guard = events.ready(Interest::PRIORITY).await?;
                match guard.try_io(|fd| ioctl::dequeue_event(fd.get_ref().0)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_regular_file_has_no_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("video10");
        std::fs::write(&path, b"").unwrap();

        let mut loopback = V4l2Loopback::new(&path, FrameFormat::new(8, 4).unwrap()).unwrap();
        assert!(loopback.subscribe(EventScheme::Legacy).is_err());

        loopback.open_writer().unwrap();
        assert!(loopback.is_writer_open());
        assert!(loopback.subscribe(EventScheme::Legacy).is_err());
        assert!(loopback.subscribe(EventScheme::Modern).is_err());
        assert!(loopback.subscribe(EventScheme::Polling).is_err());

        let waited = loopback.wait_for_event(Duration::from_millis(10)).await;
        assert!(waited.is_err());

        loopback.close_writer();
        assert!(!loopback.is_writer_open());
    }
}
