//! Pixel format and filler frame handling
//!
//! The relay speaks exactly one pixel format on the loopback device: packed
//! YUYV 4:2:2, two bytes per pixel. Everything that needs a frame size asks
//! [`FrameFormat`] instead of recomputing it.

use v4l::FourCC;

use crate::error::{RelayError, Result};

/// V4L2 fourcc codes used by the relay
pub mod fourcc {
    /// YUYV - YUV 4:2:2 packed (a.k.a. YUY2)
    pub const YUYV: [u8; 4] = *b"YUYV";
}

/// BT.601 limited-range black: Y=16, U=V=128
pub const BLACK_YUYV: [u8; 4] = [0x10, 0x80, 0x10, 0x80];

/// Bytes per pixel of the packed 4:2:2 format
pub const BYTES_PER_PIXEL: u32 = 2;

/// Fixed output format of the virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Width in pixels (must be even)
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl FrameFormat {
    /// Create a format, rejecting sizes YUYV cannot represent
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(RelayError::config(format!(
                "Resolution {}x{} cannot be zero",
                width, height
            )));
        }
        if width % 2 != 0 {
            return Err(RelayError::config(format!(
                "Width {} must be even for YUYV (two pixels per macropixel)",
                width
            )));
        }
        Ok(Self { width, height })
    }

    /// Pixel format fourcc
    pub fn fourcc(&self) -> FourCC {
        FourCC::new(&fourcc::YUYV)
    }

    /// Bytes per line
    pub fn stride(&self) -> u32 {
        self.width * BYTES_PER_PIXEL
    }

    /// Size of one frame in bytes
    pub fn frame_size(&self) -> usize {
        self.stride() as usize * self.height as usize
    }
}

impl std::fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} YUYV", self.width, self.height)
    }
}

/// Precomputed solid-color frame written while no real frame is available
///
/// Immutable after construction.
#[derive(Debug, Clone)]
pub struct FillerFrame {
    data: Box<[u8]>,
}

impl FillerFrame {
    /// Solid black filler frame
    pub fn black(format: FrameFormat) -> Result<Self> {
        Self::solid(format, BLACK_YUYV)
    }

    /// Filler frame repeating one YUYV macropixel
    pub fn solid(format: FrameFormat, macropixel: [u8; 4]) -> Result<Self> {
        let size = format.frame_size();
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|e| {
            RelayError::device(format!("Cannot allocate {} byte frame buffer: {}", size, e))
        })?;
        for _ in 0..size / macropixel.len() {
            data.extend_from_slice(&macropixel);
        }

        Ok(Self {
            data: data.into_boxed_slice(),
        })
    }

    /// Raw frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Frame size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame is empty (never true for a valid format)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let format = FrameFormat::new(1920, 1080).unwrap();
        assert_eq!(format.stride(), 3840);
        assert_eq!(format.frame_size(), 1920 * 1080 * 2);
    }

    #[test]
    fn test_rejects_odd_width() {
        assert!(FrameFormat::new(641, 480).is_err());
        assert!(FrameFormat::new(0, 480).is_err());
        assert!(FrameFormat::new(640, 0).is_err());
    }

    #[test]
    fn test_fourcc() {
        let format = FrameFormat::new(640, 480).unwrap();
        assert_eq!(format.fourcc().repr, *b"YUYV");
    }

    #[test]
    fn test_black_filler_pattern() {
        let format = FrameFormat::new(4, 2).unwrap();
        let filler = FillerFrame::black(format).unwrap();
        assert_eq!(filler.len(), 16);
        for chunk in filler.as_bytes().chunks(4) {
            assert_eq!(chunk, &BLACK_YUYV);
        }
    }

    #[test]
    fn test_solid_filler_matches_frame_size() {
        let format = FrameFormat::new(320, 240).unwrap();
        let filler = FillerFrame::solid(format, [0x80, 0x80, 0x80, 0x80]).unwrap();
        assert_eq!(filler.len(), format.frame_size());
        assert!(filler.as_bytes().iter().all(|b| *b == 0x80));
    }
}
