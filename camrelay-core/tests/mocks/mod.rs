//! Mock infrastructure for testing
//!
//! Scripted census, a loopback driver stub and small helpers to drive a
//! monitor with real time but short timings.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camrelay_core::census::{CensusProvider, Exclusions};
use camrelay_core::config::{MonitorConfig, RelayMode, Timing};
use camrelay_core::device::{ClientUsageEvent, EventScheme, Loopback};
use camrelay_core::error::{RelayError, Result};
use camrelay_core::types::RelayEvent;
use tokio::sync::mpsc;

/// Frame geometry used by the monitor tests (4x2 YUYV = 16 bytes)
pub const TEST_WIDTH: u32 = 4;
pub const TEST_HEIGHT: u32 = 2;
pub const TEST_FRAME_SIZE: usize = 16;

/// Census whose opener count is set by the test
#[derive(Debug, Clone, Default)]
pub struct MockCensus {
    count: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl MockCensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of openers every following census reports
    pub fn set(&self, openers: usize) {
        self.count.store(openers, Ordering::SeqCst);
    }

    /// How many times the census ran
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CensusProvider for MockCensus {
    fn openers(&self, _exclude: &Exclusions) -> BTreeSet<u32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (0..self.count.load(Ordering::SeqCst) as u32)
            .map(|i| 100_000 + i)
            .collect()
    }
}

/// Observable state of the loopback stub
#[derive(Debug, Default)]
pub struct LoopbackLog {
    pub writer_open: bool,
    pub opens: usize,
    pub closes: usize,
    pub fillers: usize,
    pub frames: usize,
    /// Frames of the wrong size (must stay 0)
    pub bad_frames: usize,
    /// Writes attempted while the writer was closed (must stay 0)
    pub writes_while_closed: usize,
    pub subscriptions: Vec<EventScheme>,
}

/// Loopback driver stub
///
/// Supports at most one event scheme; events are fed through a channel.
pub struct MockLoopback {
    log: Arc<Mutex<LoopbackLog>>,
    supported: Option<EventScheme>,
    subscribed: bool,
    events: mpsc::UnboundedReceiver<io::Result<ClientUsageEvent>>,
    /// Opens that fail before the first success
    failing_opens: usize,
    /// Fail every open after the first `n` successes
    opens_allowed: Option<usize>,
}

/// Test-side handle of a [`MockLoopback`]
#[derive(Clone)]
pub struct LoopbackHandle {
    pub log: Arc<Mutex<LoopbackLog>>,
    events: mpsc::UnboundedSender<io::Result<ClientUsageEvent>>,
}

impl LoopbackHandle {
    /// Deliver a driver event
    pub fn send_event(&self, event_type: u32, count: u32) {
        let _ = self.events.send(Ok(ClientUsageEvent { event_type, count }));
    }

    /// Make the next event wait fail
    pub fn send_error(&self) {
        let _ = self
            .events
            .send(Err(io::Error::new(io::ErrorKind::Other, "event channel stuck")));
    }

    pub fn snapshot<T>(&self, f: impl FnOnce(&LoopbackLog) -> T) -> T {
        f(&self.log.lock().unwrap())
    }
}

impl MockLoopback {
    pub fn new(supported: Option<EventScheme>) -> (Self, LoopbackHandle) {
        let log = Arc::new(Mutex::new(LoopbackLog::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                log: log.clone(),
                supported,
                subscribed: false,
                events: rx,
                failing_opens: 0,
                opens_allowed: None,
            },
            LoopbackHandle { log, events: tx },
        )
    }

    pub fn with_failing_opens(mut self, n: usize) -> Self {
        self.failing_opens = n;
        self
    }

    pub fn with_opens_allowed(mut self, n: usize) -> Self {
        self.opens_allowed = Some(n);
        self
    }
}

impl Loopback for MockLoopback {
    fn open_writer(&mut self) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if self.failing_opens > 0 {
            self.failing_opens -= 1;
            return Err(RelayError::device_open(
                "/dev/video-mock",
                io::Error::from(io::ErrorKind::ResourceBusy),
            ));
        }
        if let Some(allowed) = self.opens_allowed {
            if log.opens >= allowed {
                return Err(RelayError::device_open(
                    "/dev/video-mock",
                    io::Error::from(io::ErrorKind::NotFound),
                ));
            }
        }
        log.writer_open = true;
        log.opens += 1;
        log.fillers += 1;
        Ok(())
    }

    fn close_writer(&mut self) {
        self.subscribed = false;
        let mut log = self.log.lock().unwrap();
        if log.writer_open {
            log.writer_open = false;
            log.closes += 1;
        }
    }

    fn is_writer_open(&self) -> bool {
        self.log.lock().unwrap().writer_open
    }

    fn write_filler(&mut self) -> io::Result<()> {
        let mut log = self.log.lock().unwrap();
        if !log.writer_open {
            log.writes_while_closed += 1;
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        log.fillers += 1;
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut log = self.log.lock().unwrap();
        if !log.writer_open {
            log.writes_while_closed += 1;
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if frame.len() != TEST_FRAME_SIZE {
            log.bad_frames += 1;
        }
        log.frames += 1;
        Ok(())
    }

    fn subscribe(&mut self, scheme: EventScheme) -> io::Result<()> {
        if !self.is_writer_open() || self.supported != Some(scheme) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        self.subscribed = true;
        self.log.lock().unwrap().subscriptions.push(scheme);
        Ok(())
    }

    async fn wait_for_event(&mut self, timeout: Duration) -> io::Result<Option<ClientUsageEvent>> {
        if !self.subscribed {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Ok(Some(result)) => result.map(Some),
            Ok(None) => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }
}

/// Timings scaled down so a full cycle takes well under a second
pub fn fast_timing() -> Timing {
    Timing {
        filler_interval: Duration::from_millis(20),
        poll_interval: Duration::from_millis(40),
        connect_debounce: Duration::from_millis(60),
        departure_tick: Duration::from_millis(30),
        departure_ticks: 3,
        no_client_timeout: Duration::from_millis(600),
        handoff_grace: Duration::from_millis(60),
        stop_grace: Duration::from_millis(300),
        restart_backoff: Duration::from_millis(200),
        reopen_attempts: 3,
        reopen_backoff: Duration::from_millis(20),
    }
}

/// Monitor config for the stubbed device with a shell pipeline
pub fn test_config(mode: RelayMode, pipeline: &str) -> MonitorConfig {
    MonitorConfig::new("/dev/video-mock")
        .with_resolution(TEST_WIDTH, TEST_HEIGHT)
        .with_mode(mode)
        .with_command(["/bin/sh", "-c", pipeline])
        .with_timing(fast_timing())
}

/// Collects lifecycle events as they are emitted
pub fn event_channel() -> (
    mpsc::UnboundedSender<RelayEvent>,
    mpsc::UnboundedReceiver<RelayEvent>,
) {
    mpsc::unbounded_channel()
}

/// Wait for the next lifecycle event, failing the test after `limit`
pub async fn expect_event(
    rx: &mut mpsc::UnboundedReceiver<RelayEvent>,
    limit: Duration,
) -> RelayEvent {
    tokio::time::timeout(limit, rx.recv())
        .await
        .expect("timed out waiting for a lifecycle event")
        .expect("event channel closed")
}

/// Assert that no lifecycle event arrives within `window`
pub async fn expect_quiet(rx: &mut mpsc::UnboundedReceiver<RelayEvent>, window: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected lifecycle event {}", event);
    }
}

/// Run the monitor future and a driver future on the current task
pub async fn drive<M, D, T>(monitor: M, driver: D) -> (M::Output, T)
where
    M: Future,
    D: Future<Output = T>,
{
    tokio::join!(monitor, driver)
}
