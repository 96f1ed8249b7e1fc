//! Raw V4L2 ioctl glue for the loopback writer
//!
//! Format negotiation goes through the `v4l` crate's ioctl wrapper. The
//! event ioctls are not part of its code table, so their request numbers
//! are built here with the usual `_IOR`/`_IOW` layout.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::os::raw::c_void;

use v4l::format::{FieldOrder, Format};
use v4l::v4l2;
use v4l::v4l2::vidioc::_IOC_TYPE;
use v4l::v4l_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_OUTPUT, v4l2_event, v4l2_event_subscription, v4l2_format,
    V4L2_EVENT_SUB_FL_SEND_INITIAL,
};

use super::events::ClientUsageEvent;
use crate::formats::FrameFormat;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> _IOC_TYPE {
    ((dir << 30) | ((size as u32) << 16) | ((b'V' as u32) << 8) | nr) as _IOC_TYPE
}

/// `_IOR('V', 89, struct v4l2_event)`
pub const VIDIOC_DQEVENT: _IOC_TYPE = ioc(IOC_READ, 89, mem::size_of::<v4l2_event>());

/// `_IOW('V', 90, struct v4l2_event_subscription)`
pub const VIDIOC_SUBSCRIBE_EVENT: _IOC_TYPE =
    ioc(IOC_WRITE, 90, mem::size_of::<v4l2_event_subscription>());

fn retry_eintr(mut f: impl FnMut() -> io::Result<()>) -> io::Result<()> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Describe `format` as the output format of the device
pub fn set_output_format(fd: RawFd, format: &FrameFormat) -> io::Result<()> {
    let mut fmt = Format::new(format.width, format.height, format.fourcc());
    fmt.field_order = FieldOrder::Progressive;
    fmt.stride = format.stride();
    fmt.size = format.frame_size() as u32;

    retry_eintr(|| unsafe {
        let mut v4l2_fmt: v4l2_format = mem::zeroed();
        v4l2_fmt.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_OUTPUT;
        v4l2_fmt.fmt.pix = fmt.into();
        v4l2::ioctl(
            fd,
            v4l2::vidioc::VIDIOC_S_FMT,
            &mut v4l2_fmt as *mut _ as *mut c_void,
        )
    })
}

/// Subscribe to one event type, asking for the current state immediately
pub fn subscribe_event(fd: RawFd, event_type: u32) -> io::Result<()> {
    retry_eintr(|| unsafe {
        let mut sub: v4l2_event_subscription = mem::zeroed();
        sub.type_ = event_type;
        sub.flags = V4L2_EVENT_SUB_FL_SEND_INITIAL;
        v4l2::ioctl(
            fd,
            VIDIOC_SUBSCRIBE_EVENT,
            &mut sub as *mut _ as *mut c_void,
        )
    })
}

/// Dequeue one pending event
///
/// An empty queue is reported as [`io::ErrorKind::WouldBlock`] so callers
/// can use it directly with readiness-based I/O.
pub fn dequeue_event(fd: RawFd) -> io::Result<ClientUsageEvent> {
    let mut ev: v4l2_event = unsafe { mem::zeroed() };

    let result = retry_eintr(|| unsafe {
        v4l2::ioctl(fd, VIDIOC_DQEVENT, &mut ev as *mut _ as *mut c_void)
    });

    match result {
        Ok(()) => {
            // SAFETY: the data member spans the whole union and is plain bytes.
            let data = unsafe { ev.u.data };
            let count = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
            Ok(ClientUsageEvent {
                event_type: ev.type_,
                count,
            })
        }
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "no pending event"))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_event_request_codes() {
        assert_eq!(VIDIOC_DQEVENT as u64, 0x8088_5659);
        assert_eq!(VIDIOC_SUBSCRIBE_EVENT as u64, 0x4020_565a);
    }

    #[test]
    fn test_ioctl_on_regular_file_fails() {
        use std::os::fd::AsRawFd;

        let file = tempfile::tempfile().unwrap();
        let format = FrameFormat::new(64, 48).unwrap();
        assert!(set_output_format(file.as_raw_fd(), &format).is_err());
        assert!(subscribe_event(file.as_raw_fd(), 0x0800_0000).is_err());
        assert!(dequeue_event(file.as_raw_fd()).is_err());
    }
}
