//! Write side of the loopback device
//!
//! The writer keeps the device "ready": the format is declared once per
//! open and a filler frame follows immediately, so a client opening the
//! capture side can stream before any real frame exists.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::ioctl;
use crate::error::{RelayError, Result};
use crate::formats::{FillerFrame, FrameFormat};

/// Owner of the device's write handle
#[derive(Debug)]
pub struct DeviceWriter {
    /// Device path
    path: PathBuf,
    /// Fixed output format
    format: FrameFormat,
    /// Precomputed filler frame
    filler: FillerFrame,
    /// Open handle, `None` while yielded or closed
    file: Option<File>,
}

impl DeviceWriter {
    /// Create a writer; the filler frame is allocated here
    pub fn new(path: impl Into<PathBuf>, format: FrameFormat) -> Result<Self> {
        Ok(Self {
            path: path.into(),
            format,
            filler: FillerFrame::black(format)?,
            file: None,
        })
    }

    /// Open the device write-only, declare the format and write one filler
    ///
    /// Only the open itself can fail; format and first-frame problems are
    /// logged because some driver versions tolerate them.
    pub fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }

        // Non-blocking so VIDIOC_DQEVENT reports an empty queue instead of
        // sleeping in the kernel.
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| RelayError::device_open(&self.path, e))?;

        if let Err(e) = ioctl::set_output_format(file.as_raw_fd(), &self.format) {
            warn!(
                "VIDIOC_S_FMT on {} failed: {} (continuing)",
                self.path.display(),
                e
            );
        }

        self.file = Some(file);

        if let Err(e) = self.write_filler() {
            warn!("Initial filler frame write failed: {} (continuing)", e);
        }

        info!("Writer open on {} ({})", self.path.display(), self.format);
        Ok(())
    }

    /// Release the handle
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("Writer closed on {}", self.path.display());
        }
    }

    /// Whether the handle is currently held
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Raw descriptor of the open handle
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Write the filler frame
    pub fn write_filler(&mut self) -> io::Result<()> {
        let Self { file, filler, .. } = self;
        write_whole_frame(file.as_mut(), filler.as_bytes())
    }

    /// Write one real frame; anything but exactly one frame is rejected
    pub fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if frame.len() != self.format.frame_size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame is {} bytes, expected {}",
                    frame.len(),
                    self.format.frame_size()
                ),
            ));
        }
        write_whole_frame(self.file.as_mut(), frame)
    }
}

/// Single write(2) per frame; a short write is reported, never completed
/// with a second call that would start mid-frame on the driver side.
fn write_whole_frame(file: Option<&mut File>, frame: &[u8]) -> io::Result<()> {
    let file = file.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "writer closed"))?;

    loop {
        match file.write(frame) {
            Ok(n) if n == frame.len() => return Ok(()),
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {} of {} bytes", n, frame.len()),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
