//! Starts and stops the real pipeline

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{ChildStdout, Command};
use tracing::{info, warn};

use super::{FrameReader, PipelineChild, PipelineCommand, Placeholders};
use crate::config::{MonitorConfig, RelayMode};
use crate::error::{RelayError, Result};
use crate::formats::FrameFormat;

/// Launches at most one pipeline at a time and tears it down within a
/// bounded time
#[derive(Debug, Clone)]
pub struct PipelineSupervisor {
    /// Command template
    command: PipelineCommand,
    /// Relay (stdout pipe) or yield (device handed over)
    mode: RelayMode,
    /// Loopback device path
    device: PathBuf,
    /// Frame format the pipeline must produce
    format: FrameFormat,
    /// SIGTERM -> SIGKILL delay
    stop_grace: Duration,
}

impl PipelineSupervisor {
    /// Create a supervisor
    pub fn new(
        command: PipelineCommand,
        mode: RelayMode,
        device: impl Into<PathBuf>,
        format: FrameFormat,
        stop_grace: Duration,
    ) -> Self {
        Self {
            command,
            mode,
            device: device.into(),
            format,
            stop_grace,
        }
    }

    /// Supervisor for a monitor configuration
    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        Ok(Self::new(
            PipelineCommand::from_config(config)?,
            config.mode,
            config.device.clone(),
            config.frame_format()?,
            config.timing.stop_grace,
        ))
    }

    /// Launch the pipeline
    ///
    /// In relay mode the returned reader yields the pipeline's frames; in
    /// yield mode there is no reader and stdout is discarded.
    pub fn start(&self) -> Result<(PipelineChild, Option<FrameReader<ChildStdout>>)> {
        let values = Placeholders::new(&self.device, self.format, self.mode);
        let args = self.command.render_args(&values);

        let stdout = match self.mode {
            RelayMode::Relay => Stdio::piped(),
            RelayMode::Yield => Stdio::null(),
        };

        let mut child = Command::new(self.command.program())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::pipeline(format!(
                    "Failed to launch {}: {}",
                    self.command.program(),
                    e
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| RelayError::pipeline("Pipeline exited before it could be tracked"))?;

        let reader = child
            .stdout
            .take()
            .map(|out| FrameReader::new(out, self.format.frame_size()));

        info!(
            "Pipeline started (pid {}): {} {}",
            pid,
            self.command.program(),
            args.join(" ")
        );

        Ok((PipelineChild::new(child, pid), reader))
    }

    /// Stop the pipeline: SIGTERM, bounded wait, then SIGKILL
    ///
    /// Any failure on the way escalates to SIGKILL instead of giving up.
    pub async fn stop(&self, child: &mut PipelineChild) -> Result<ExitStatus> {
        let status = match child.try_status() {
            Ok(Some(status)) => {
                info!("Pipeline {} already exited: {}", child.pid(), status);
                status
            }
            Ok(None) => self.terminate_and_wait(child).await?,
            Err(e) => {
                warn!("Cannot poll pipeline {} ({}), killing", child.pid(), e);
                child.kill().await?
            }
        };

        // Whatever the leader left behind must not keep the camera.
        match child.kill_stragglers() {
            Ok(true) => info!(
                "Killed leftover processes in pipeline group {}",
                child.process_group()
            ),
            Ok(false) => {}
            Err(e) => warn!(
                "Cannot kill leftover processes in pipeline group {}: {}",
                child.process_group(),
                e
            ),
        }

        info!(
            "Pipeline {} stopped after {:?}: {}",
            child.pid(),
            child.uptime(),
            status
        );
        Ok(status)
    }

    async fn terminate_and_wait(&self, child: &mut PipelineChild) -> Result<ExitStatus> {
        if let Err(e) = child.terminate() {
            warn!("SIGTERM to pipeline {} failed: {}", child.pid(), e);
        }

        match child.wait_timeout(self.stop_grace).await {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                warn!(
                    "Pipeline {} ignored SIGTERM for {:?}, killing",
                    child.pid(),
                    self.stop_grace
                );
                Ok(child.kill().await?)
            }
            Err(e) => {
                warn!("Waiting for pipeline {} failed ({}), killing", child.pid(), e);
                Ok(child.kill().await?)
            }
        }
    }
}
