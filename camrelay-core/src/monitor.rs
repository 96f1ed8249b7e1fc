//! Idle/active state machine
//!
//! ```text
//!            connect signal + census confirms
//!   ┌──────┐ ───────────────────────────────▶ ┌────────┐
//!   │ Idle │                                  │ Active │
//!   └──────┘ ◀─────────────────────────────── └────────┘
//!    filler     clients left / nobody came /    pipeline running,
//!    frames     pipeline died                   frames relayed
//! ```
//!
//! Everything runs on the caller's task: one loop owns the writer, the
//! pipeline child and every counter, so no locking is involved.

use std::fmt;
use std::io;
use std::process::ExitStatus;

use tokio::process::ChildStdout;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::census::{CensusProvider, Exclusions, ProcCensus};
use crate::config::MonitorConfig;
use crate::device::{ClientSignal, ClientUsageEvent, EventScheme, Loopback, V4l2Loopback};
use crate::error::{RelayError, Result, ResultExt};
use crate::pipeline::{FrameReader, PipelineChild, PipelineSupervisor};
use crate::shutdown::Shutdown;
use crate::types::{EventSink, MonitorStats, RelayEvent, StdoutSink};

/// Why an active session ended
#[derive(Debug)]
enum StopReason {
    /// Census stayed at zero for the departure window
    ClientsLeft,
    /// Nobody ever showed up after START
    NobodyCame,
    /// Pipeline process exited on its own
    PipelineExited(ExitStatus),
    /// Pipeline stdout reached end of stream
    PipelineOutputClosed,
    /// Waiting on or reading from the pipeline failed
    PipelineError(io::Error),
    /// Termination requested
    Shutdown,
}

impl StopReason {
    /// Whether the pipeline failed rather than being stopped on purpose
    fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::PipelineExited(_) | Self::PipelineOutputClosed | Self::PipelineError(_)
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientsLeft => write!(f, "all clients left"),
            Self::NobodyCame => write!(f, "no client appeared"),
            Self::PipelineExited(status) => write!(f, "pipeline exited ({})", status),
            Self::PipelineOutputClosed => write!(f, "pipeline output closed"),
            Self::PipelineError(e) => write!(f, "pipeline error: {}", e),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Idle state counters
#[derive(Debug)]
struct IdleState {
    /// Census result of the last poll, for rising-edge detection
    prev_clients: usize,
    /// Next filler frame
    next_filler: Instant,
    /// Next census poll (polling scheme only)
    next_poll: Instant,
    /// Connect signals are ignored until then; a census recheck follows
    cooldown_until: Option<Instant>,
}

impl IdleState {
    fn new(cooldown_until: Option<Instant>) -> Self {
        let now = Instant::now();
        Self {
            prev_clients: 0,
            next_filler: now,
            next_poll: now,
            cooldown_until,
        }
    }

    fn deadline(&self, scheme: EventScheme) -> Instant {
        let mut deadline = self.next_filler;
        if let Some(until) = self.cooldown_until {
            deadline = deadline.min(until);
        } else if !scheme.uses_events() {
            deadline = deadline.min(self.next_poll);
        }
        deadline
    }
}

/// A running pipeline and its departure counters
#[derive(Debug)]
struct ActiveSession {
    child: PipelineChild,
    /// Relay mode frame source
    reader: Option<FrameReader<ChildStdout>>,
    started: Instant,
    /// Highest census result since START
    peak: usize,
    /// Consecutive zero-client census ticks
    quiet_ticks: u32,
    next_tick: Instant,
    /// Last frame (real or filler) written in relay mode
    last_write: Instant,
}

enum Phase {
    Idle(IdleState),
    Active(ActiveSession),
}

enum IdleOutcome {
    Continue,
    Activate,
    Shutdown,
}

enum IdleWake {
    Shutdown,
    Timer,
    Event(io::Result<Option<ClientUsageEvent>>),
}

enum ActiveWake {
    Shutdown,
    Exited(io::Result<ExitStatus>),
    Frame(io::Result<bool>),
    Timer,
}

async fn next_frame(reader: &mut Option<FrameReader<ChildStdout>>) -> io::Result<bool> {
    match reader {
        Some(reader) => reader.next_frame().await,
        None => std::future::pending().await,
    }
}

/// The relay monitor
pub struct Monitor<C, L, E> {
    config: MonitorConfig,
    census: C,
    loopback: L,
    sink: E,
    supervisor: PipelineSupervisor,
    /// Negotiated detection scheme
    scheme: EventScheme,
    self_pid: u32,
    stats: MonitorStats,
}

impl Monitor<ProcCensus, V4l2Loopback, StdoutSink> {
    /// Monitor for a real v4l2loopback device, reporting on stdout
    pub fn for_device(config: MonitorConfig) -> Result<Self> {
        let census =
            ProcCensus::new(&config.device).with_same_user_only(config.same_user_only);
        let loopback = V4l2Loopback::new(config.device.clone(), config.frame_format()?)
            .context("Preparing the loopback writer")?;
        Self::new(config, census, loopback, StdoutSink)
    }
}

impl<C, L, E> Monitor<C, L, E>
where
    C: CensusProvider,
    L: Loopback,
    E: EventSink,
{
    /// Create a monitor from its collaborators
    pub fn new(config: MonitorConfig, census: C, loopback: L, sink: E) -> Result<Self> {
        config.validate_strict().map_err(RelayError::config)?;
        for warning in config.validate() {
            warn!("{}", warning);
        }

        let supervisor = PipelineSupervisor::from_config(&config)?;

        Ok(Self {
            config,
            census,
            loopback,
            sink,
            supervisor,
            scheme: EventScheme::Polling,
            self_pid: std::process::id(),
            stats: MonitorStats::default(),
        })
    }

    /// Statistics so far
    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    /// Currently negotiated detection scheme
    pub fn scheme(&self) -> EventScheme {
        self.scheme
    }

    /// Run until `shutdown` fires
    ///
    /// Only setup failures are returned as errors: the initial writer open
    /// and reacquiring the writer after a cycle.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<MonitorStats> {
        self.loopback
            .open_writer()
            .context("Cannot start without a writer on the loopback device")?;
        self.scheme = self.negotiate_events();

        info!(
            "Watching {} ({}x{})",
            self.config.device.display(),
            self.config.width,
            self.config.height
        );
        self.sink.emit(RelayEvent::Ready);

        let mut phase = Phase::Idle(IdleState::new(None));

        loop {
            if shutdown.is_set() {
                break;
            }

            phase = match phase {
                Phase::Idle(mut idle) => match self.idle_step(&mut idle, &mut shutdown).await {
                    IdleOutcome::Continue => Phase::Idle(idle),
                    IdleOutcome::Shutdown => Phase::Idle(idle),
                    IdleOutcome::Activate => self.activate(&mut shutdown).await?,
                },
                Phase::Active(mut session) => {
                    match self.active_step(&mut session, &mut shutdown).await {
                        None => Phase::Active(session),
                        Some(StopReason::Shutdown) => {
                            self.stop_session(session, &StopReason::Shutdown).await;
                            Phase::Idle(IdleState::new(None))
                        }
                        Some(reason) => self.deactivate(session, reason, &mut shutdown).await?,
                    }
                }
            };
        }

        if let Phase::Active(session) = phase {
            self.stop_session(session, &StopReason::Shutdown).await;
        }

        self.loopback.close_writer();
        info!("Monitor stopped: {}", self.stats);
        Ok(self.stats)
    }

    fn negotiate_events(&mut self) -> EventScheme {
        if !self.config.use_events {
            debug!("Driver events disabled, polling the census");
            return EventScheme::Polling;
        }

        for scheme in EventScheme::NEGOTIATION_ORDER {
            match self.loopback.subscribe(scheme) {
                Ok(()) => {
                    info!("Using {} for client detection", scheme);
                    return scheme;
                }
                Err(e) => debug!("{} unavailable: {}", scheme, e),
            }
        }

        info!(
            "Driver has no client-usage events, polling every {:?}",
            self.config.timing.poll_interval
        );
        EventScheme::Polling
    }

    fn idle_exclusions(&self) -> Exclusions {
        Exclusions::default().with_pid(self.self_pid)
    }

    fn write_filler(&mut self) {
        match self.loopback.write_filler() {
            Ok(()) => self.stats.fillers_written += 1,
            Err(e) => debug!("Filler frame write failed: {}", e),
        }
    }

    async fn idle_step(&mut self, idle: &mut IdleState, shutdown: &mut Shutdown) -> IdleOutcome {
        let timing = self.config.timing;
        let now = Instant::now();

        if now >= idle.next_filler {
            self.write_filler();
            idle.next_filler = now + timing.filler_interval;
        }

        let mut candidate = false;

        if let Some(until) = idle.cooldown_until {
            if now >= until {
                idle.cooldown_until = None;
                let clients = self.census.count_openers(&self.idle_exclusions());
                debug!("Backoff over, {} client(s) present", clients);
                idle.prev_clients = clients;
                candidate = clients > 0;
            }
        } else if !self.scheme.uses_events() && now >= idle.next_poll {
            idle.next_poll = now + timing.poll_interval;
            let clients = self.census.count_openers(&self.idle_exclusions());
            if clients > 0 && idle.prev_clients == 0 {
                debug!("Opener count rose 0 -> {}", clients);
                candidate = true;
            }
            idle.prev_clients = clients;
        }

        if !candidate {
            let deadline = idle.deadline(self.scheme);
            let wake = tokio::select! {
                _ = shutdown.wait() => IdleWake::Shutdown,
                result = self.loopback.wait_for_event(timing.filler_interval),
                    if self.scheme.uses_events() => IdleWake::Event(result),
                _ = sleep_until(deadline) => IdleWake::Timer,
            };

            match wake {
                IdleWake::Shutdown => return IdleOutcome::Shutdown,
                IdleWake::Timer | IdleWake::Event(Ok(None)) => return IdleOutcome::Continue,
                IdleWake::Event(Ok(Some(event))) => match self.scheme.decode(&event) {
                    Some(ClientSignal::Connected) if idle.cooldown_until.is_some() => {
                        debug!("Connect event ignored during restart backoff");
                        return IdleOutcome::Continue;
                    }
                    Some(ClientSignal::Connected) => {
                        debug!("Connect event (count {})", event.count);
                        candidate = true;
                    }
                    Some(ClientSignal::Disconnected) => {
                        debug!("Disconnect event (count {})", event.count);
                        return IdleOutcome::Continue;
                    }
                    None => {
                        trace!("Ignoring event type {:#x}", event.event_type);
                        return IdleOutcome::Continue;
                    }
                },
                IdleWake::Event(Err(e)) => {
                    warn!(
                        "Waiting for {} failed: {}; falling back to polling",
                        self.scheme, e
                    );
                    self.scheme = EventScheme::Polling;
                    idle.prev_clients = 0;
                    idle.next_poll = Instant::now();
                    return IdleOutcome::Continue;
                }
            }
        }

        // Media frameworks probe devices briefly; only a consumer that is
        // still there after the debounce counts.
        tokio::select! {
            _ = shutdown.wait() => return IdleOutcome::Shutdown,
            _ = sleep(timing.connect_debounce) => {}
        }

        let clients = self.census.count_openers(&self.idle_exclusions());
        if clients > 0 {
            info!("{} client(s) attached", clients);
            IdleOutcome::Activate
        } else {
            self.stats.false_probes += 1;
            debug!("Connect signal not confirmed by census, ignoring probe");
            idle.prev_clients = 0;
            IdleOutcome::Continue
        }
    }

    async fn activate(&mut self, shutdown: &mut Shutdown) -> Result<Phase> {
        self.sink.emit(RelayEvent::Start);

        if self.config.mode.yields_writer() {
            self.loopback.close_writer();
        }

        match self.supervisor.start() {
            Ok((child, reader)) => {
                let now = Instant::now();
                Ok(Phase::Active(ActiveSession {
                    child,
                    reader,
                    started: now,
                    peak: 0,
                    quiet_ticks: 0,
                    next_tick: now + self.config.timing.departure_tick,
                    last_write: now,
                }))
            }
            Err(e) => {
                error!("{}", e);
                self.stats.pipeline_failures += 1;
                self.stats.cycles += 1;
                self.sink.emit(RelayEvent::Stop);
                Ok(Phase::Idle(self.return_to_idle(true, shutdown).await?))
            }
        }
    }

    async fn active_step(
        &mut self,
        session: &mut ActiveSession,
        shutdown: &mut Shutdown,
    ) -> Option<StopReason> {
        let timing = self.config.timing;
        let relaying = !self.config.mode.yields_writer();
        let now = Instant::now();

        if relaying && now >= session.last_write + timing.filler_interval {
            self.write_filler();
            session.last_write = now;
        }

        if now >= session.next_tick {
            session.next_tick = now + timing.departure_tick;

            let in_handoff = !relaying && session.started.elapsed() < timing.handoff_grace;
            if !in_handoff {
                let exclude = self
                    .idle_exclusions()
                    .with_process_group(session.child.process_group());
                let clients = self.census.count_openers(&exclude);

                session.peak = session.peak.max(clients);
                if clients == 0 {
                    session.quiet_ticks += 1;
                } else {
                    session.quiet_ticks = 0;
                }
                trace!(
                    "Active tick: {} client(s), peak {}, quiet {}",
                    clients,
                    session.peak,
                    session.quiet_ticks
                );

                if session.peak > 0 && session.quiet_ticks >= timing.departure_ticks {
                    return Some(StopReason::ClientsLeft);
                }
            }
        }

        if session.peak == 0 && session.started.elapsed() >= timing.no_client_timeout {
            return Some(StopReason::NobodyCame);
        }

        let mut deadline = session.next_tick;
        if relaying {
            deadline = deadline.min(session.last_write + timing.filler_interval);
        }

        let wake = {
            let ActiveSession { child, reader, .. } = session;
            tokio::select! {
                biased;
                _ = shutdown.wait() => ActiveWake::Shutdown,
                status = child.wait() => ActiveWake::Exited(status),
                result = next_frame(reader) => ActiveWake::Frame(result),
                _ = sleep_until(deadline) => ActiveWake::Timer,
            }
        };

        match wake {
            ActiveWake::Shutdown => Some(StopReason::Shutdown),
            ActiveWake::Timer => None,
            ActiveWake::Exited(Ok(status)) => Some(StopReason::PipelineExited(status)),
            ActiveWake::Exited(Err(e)) => Some(StopReason::PipelineError(e)),
            ActiveWake::Frame(Ok(true)) => {
                if let Some(reader) = &session.reader {
                    match self.loopback.write_frame(reader.frame()) {
                        Ok(()) => {
                            self.stats.frames_relayed += 1;
                            session.last_write = Instant::now();
                        }
                        Err(e) => debug!("Frame write failed: {}", e),
                    }
                }
                None
            }
            ActiveWake::Frame(Ok(false)) => Some(StopReason::PipelineOutputClosed),
            ActiveWake::Frame(Err(e)) => Some(StopReason::PipelineError(e)),
        }
    }

    /// Stop the pipeline and emit STOP
    async fn stop_session(&mut self, session: ActiveSession, reason: &StopReason) {
        let ActiveSession {
            mut child,
            reader,
            started,
            ..
        } = session;
        drop(reader);

        if let Err(e) = self.supervisor.stop(&mut child).await {
            warn!("Stopping pipeline {}: {}", child.pid(), e);
        }

        self.stats.cycles += 1;
        self.sink.emit(RelayEvent::Stop);

        if reason.is_failure() {
            self.stats.pipeline_failures += 1;
            warn!("Session ended after {:?}: {}", started.elapsed(), reason);
        } else {
            info!("Session ended after {:?}: {}", started.elapsed(), reason);
        }
    }

    async fn deactivate(
        &mut self,
        session: ActiveSession,
        reason: StopReason,
        shutdown: &mut Shutdown,
    ) -> Result<Phase> {
        self.stop_session(session, &reason).await;
        let idle = self.return_to_idle(reason.is_failure(), shutdown).await?;
        Ok(Phase::Idle(idle))
    }

    async fn return_to_idle(&mut self, failed: bool, shutdown: &mut Shutdown) -> Result<IdleState> {
        self.restore_writer(shutdown).await?;

        let cooldown = failed.then(|| {
            debug!(
                "Ignoring connect signals for {:?}",
                self.config.timing.restart_backoff
            );
            Instant::now() + self.config.timing.restart_backoff
        });
        Ok(IdleState::new(cooldown))
    }

    /// Reacquire the writer (and events) after a cycle
    ///
    /// Drivers can leave the event channel stuck after a cycle, so the
    /// handle is cycled and events renegotiated unless disabled.
    async fn restore_writer(&mut self, shutdown: &mut Shutdown) -> Result<()> {
        let cycle = self.config.mode.yields_writer() || self.config.resubscribe_after_cycle;
        if !cycle && self.loopback.is_writer_open() {
            return Ok(());
        }

        self.loopback.close_writer();

        let attempts = self.config.timing.reopen_attempts.max(1);
        for attempt in 1..=attempts {
            match self.loopback.open_writer() {
                Ok(()) => {
                    self.scheme = self.negotiate_events();
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Reopening {} failed (attempt {}/{}): {}",
                        self.config.device.display(),
                        attempt,
                        attempts,
                        e
                    );
                    tokio::select! {
                        _ = shutdown.wait() => return Ok(()),
                        _ = sleep(self.config.timing.reopen_backoff) => {}
                    }
                }
                Err(e) => {
                    return Err(e.with_context(format!(
                        "Cannot reacquire {} after {} attempts",
                        self.config.device.display(),
                        attempts
                    )))
                }
            }
        }

        Ok(())
    }
}
