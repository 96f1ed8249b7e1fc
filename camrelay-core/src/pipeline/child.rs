//! Typed handle for the running pipeline process

use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tracing::{debug, trace};

use crate::census::live_group_members;

/// Lifecycle of a pipeline process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Spawned, no signal sent yet
    Running,
    /// SIGTERM was sent to the process group
    TerminationRequested {
        /// When the signal was sent
        at: Instant,
    },
    /// Reaped
    Exited(ExitStatus),
}

/// The pipeline process and its process group
///
/// The process is spawned as the leader of a new process group, so signals
/// reach wrapper scripts and everything they started.
#[derive(Debug)]
pub struct PipelineChild {
    child: Child,
    pid: u32,
    state: ChildState,
    started: Instant,
}

impl PipelineChild {
    pub(crate) fn new(child: Child, pid: u32) -> Self {
        Self {
            child,
            pid,
            state: ChildState::Running,
            started: Instant::now(),
        }
    }

    /// PID of the group leader
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Process group (equal to the leader's PID)
    pub fn process_group(&self) -> u32 {
        self.pid
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChildState {
        self.state
    }

    /// Time since spawn
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the process was reaped
    pub fn has_exited(&self) -> bool {
        matches!(self.state, ChildState::Exited(_))
    }

    /// Send SIGTERM to the process group
    pub fn terminate(&mut self) -> io::Result<()> {
        match self.state {
            ChildState::Exited(_) => Ok(()),
            ChildState::TerminationRequested { .. } => Ok(()),
            ChildState::Running => {
                signal_group(self.pid, libc::SIGTERM)?;
                self.state = ChildState::TerminationRequested { at: Instant::now() };
                debug!("Sent SIGTERM to pipeline group {}", self.pid);
                Ok(())
            }
        }
    }

    /// Wait for the process to exit
    ///
    /// Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let ChildState::Exited(status) = self.state {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.state = ChildState::Exited(status);
        trace!("Pipeline {} reaped: {}", self.pid, status);
        Ok(status)
    }

    /// Wait for exit for at most `limit`
    pub async fn wait_timeout(&mut self, limit: Duration) -> io::Result<Option<ExitStatus>> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(status) => status.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    /// SIGKILL the process group and reap the leader
    pub async fn kill(&mut self) -> io::Result<ExitStatus> {
        if let ChildState::Exited(status) = self.state {
            self.kill_stragglers()?;
            return Ok(status);
        }
        if let Err(e) = signal_group(self.pid, libc::SIGKILL) {
            debug!("Group kill failed ({}), killing leader only", e);
            self.child.start_kill()?;
        }
        self.wait().await
    }

    /// SIGKILL processes left in the group after the leader was reaped
    ///
    /// A reaped leader no longer pins its PID, so the group is only signalled
    /// while `/proc` still lists a live member of it. Returns whether a
    /// signal was sent.
    pub fn kill_stragglers(&self) -> io::Result<bool> {
        let members = live_group_members(Path::new(PROC_ROOT), self.pid);
        if members.is_empty() {
            return Ok(false);
        }
        debug!(
            "Killing {} leftover process(es) in group {}: {:?}",
            members.len(),
            self.pid,
            members
        );
        signal_group(self.pid, libc::SIGKILL)?;
        Ok(true)
    }

    /// Non-blocking exit check
    pub fn try_status(&mut self) -> io::Result<Option<ExitStatus>> {
        if let ChildState::Exited(status) = self.state {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        if let Some(status) = status {
            self.state = ChildState::Exited(status);
        }
        Ok(status)
    }
}

const PROC_ROOT: &str = "/proc";

/// Signal a whole process group; an already empty group is not an error
fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: kill has no memory safety preconditions.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}
