//! Fixed-size frame reader for the pipeline's stdout

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// Reassembles whole frames from a byte stream
///
/// [`next_frame`](Self::next_frame) is cancel safe: a partially read frame
/// stays buffered and the next call continues it.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: Box<[u8]>,
    filled: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Reader producing frames of `frame_size` bytes
    pub fn new(inner: R, frame_size: usize) -> Self {
        Self {
            inner,
            buf: vec![0u8; frame_size].into_boxed_slice(),
            filled: 0,
        }
    }

    /// Read until one whole frame is buffered
    ///
    /// Returns `Ok(false)` at end of stream; a trailing partial frame is
    /// discarded.
    pub async fn next_frame(&mut self) -> std::io::Result<bool> {
        if self.filled == self.buf.len() {
            self.filled = 0;
        }

        while self.filled < self.buf.len() {
            let n = self.inner.read(&mut self.buf[self.filled..]).await?;
            if n == 0 {
                if self.filled > 0 {
                    warn!(
                        "Pipeline output ended mid-frame ({} of {} bytes)",
                        self.filled,
                        self.buf.len()
                    );
                    self.filled = 0;
                }
                return Ok(false);
            }
            self.filled += n;
        }

        Ok(true)
    }

    /// The last complete frame
    pub fn frame(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// Frame size in bytes
    pub fn frame_size(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_reassembles_split_frames() {
        let stream = Builder::new()
            .read(b"ab")
            .read(b"cdef")
            .read(b"gh")
            .build();
        let mut reader = FrameReader::new(stream, 4);

        assert!(reader.next_frame().await.unwrap());
        assert_eq!(reader.frame(), b"abcd");
        assert!(reader.next_frame().await.unwrap());
        assert_eq!(reader.frame(), b"efgh");
        assert!(!reader.next_frame().await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_trailing_frame_is_eof() {
        let stream = Builder::new().read(b"abcd").read(b"ef").build();
        let mut reader = FrameReader::new(stream, 4);

        assert!(reader.next_frame().await.unwrap());
        assert!(!reader.next_frame().await.unwrap());
        assert!(reader.frame().is_empty());
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let stream = Builder::new()
            .read(b"ab")
            .read_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let mut reader = FrameReader::new(stream, 4);

        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
