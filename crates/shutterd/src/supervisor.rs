//! External capture process supervision.
//!
//! The supervisor owns at most one active external capture process at a
//! time. It spawns the opaque capture tools (`raspistill`/`raspivid` by
//! default), reaps their exit status, and implements graceful-then-forced
//! termination. No child process outlives the daemon: children are spawned
//! with `kill_on_drop` so abrupt shutdown paths are covered too.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::CameraConfig;
use crate::error::{Error, Result};

/// How long to wait for a SIGKILLed child to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// A request for one external capture process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureRequest {
    /// One still photo written to `output`.
    Photo {
        /// Destination file.
        output: PathBuf,
    },
    /// A recording of operator-controlled duration written to `output`.
    Video {
        /// Destination file.
        output: PathBuf,
    },
    /// A live preview with no output file.
    Preview,
}

impl CaptureRequest {
    /// The output file this request produces, if any.
    #[must_use]
    pub fn output(&self) -> Option<&PathBuf> {
        match self {
            Self::Photo { output } | Self::Video { output } => Some(output),
            Self::Preview => None,
        }
    }

    /// Whether this request runs until explicitly stopped.
    #[must_use]
    pub fn is_long_running(&self) -> bool {
        matches!(self, Self::Video { .. } | Self::Preview)
    }
}

impl std::fmt::Display for CaptureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Photo { .. } => write!(f, "photo"),
            Self::Video { .. } => write!(f, "video"),
            Self::Preview => write!(f, "preview"),
        }
    }
}

/// How a capture process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with status zero.
    Success,
    /// Terminated by a signal.
    Killed,
    /// Exited with a non-zero status. Recoverable; never crashes the daemon.
    NonZeroExit(i32),
    /// The capture command does not exist. Fatal at daemon startup if the
    /// tool is entirely absent, recoverable per call otherwise.
    CommandNotFound,
}

impl ExitOutcome {
    /// Whether the process produced a usable result.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process exited within the grace timeout.
    Exited(ExitOutcome),
    /// The process ignored the termination request and was killed.
    Killed,
    /// No process was running.
    NotRunning,
}

/// A supervised child process.
#[async_trait::async_trait]
pub trait CaptureChild: Send + std::fmt::Debug {
    /// Wait for the process to exit and reap its status. Cancel safe.
    async fn wait(&mut self) -> Result<ExitOutcome>;

    /// Check for exit without blocking.
    async fn try_wait(&mut self) -> Result<Option<ExitOutcome>>;

    /// Request graceful termination (SIGTERM).
    fn terminate(&mut self) -> Result<()>;

    /// Force termination (SIGKILL).
    fn kill(&mut self) -> Result<()>;
}

/// A source of capture processes.
///
/// The real implementation shells out to the configured camera tools; tests
/// substitute a mock that fabricates outcomes without touching hardware.
#[async_trait::async_trait]
pub trait CaptureBackend: Send + Sync + std::fmt::Debug {
    /// Name of this backend (for logging).
    fn name(&self) -> &'static str;

    /// Verify the capture hardware/tooling is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`] when the photo tool is
    /// entirely absent. A missing video tool only degrades functionality
    /// and is logged, not fatal.
    async fn probe(&self) -> Result<()>;

    /// Spawn a process for the given request.
    ///
    /// # Errors
    ///
    /// Returns an error when the process cannot be spawned for reasons
    /// other than a missing command; a missing command is reported through
    /// [`ExitOutcome::CommandNotFound`] on the returned child so callers
    /// handle it on the normal completion path.
    async fn spawn(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureChild>>;
}

/// A real tokio child process.
#[derive(Debug)]
struct TokioChild {
    child: Child,
}

#[async_trait::async_trait]
impl CaptureChild for TokioChild {
    async fn wait(&mut self) -> Result<ExitOutcome> {
        let status = self.child.wait().await?;
        Ok(exit_outcome(&status))
    }

    async fn try_wait(&mut self) -> Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(|status| exit_outcome(&status)))
    }

    fn terminate(&mut self) -> Result<()> {
        if let Some(id) = self.child.id() {
            let pid = Pid::from_raw(
                i32::try_from(id).map_err(|_| Error::internal("pid out of range"))?,
            );
            kill(pid, Signal::SIGTERM)
                .map_err(|errno| Error::capture_process(format!("SIGTERM failed: {errno}")))?;
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }
}

/// Stand-in child for a command that does not exist.
///
/// Lets a per-call missing tool surface as a normal completion outcome
/// instead of a separate error path.
#[derive(Debug)]
struct StillbornChild;

#[async_trait::async_trait]
impl CaptureChild for StillbornChild {
    async fn wait(&mut self) -> Result<ExitOutcome> {
        Ok(ExitOutcome::CommandNotFound)
    }

    async fn try_wait(&mut self) -> Result<Option<ExitOutcome>> {
        Ok(Some(ExitOutcome::CommandNotFound))
    }

    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        Ok(())
    }
}

fn exit_outcome(status: &std::process::ExitStatus) -> ExitOutcome {
    if status.success() {
        ExitOutcome::Success
    } else {
        match status.code() {
            Some(code) => ExitOutcome::NonZeroExit(code),
            None => ExitOutcome::Killed,
        }
    }
}

/// Backend that invokes the Raspberry Pi legacy camera tools.
///
/// The tools are opaque: the daemon passes resolution, quality or bitrate,
/// duration and output path, then observes only the exit code and the
/// produced file.
#[derive(Debug)]
pub struct RaspiBackend {
    camera: CameraConfig,
}

impl RaspiBackend {
    /// Create a backend from camera configuration.
    #[must_use]
    pub fn new(camera: CameraConfig) -> Self {
        Self { camera }
    }

    fn command_for(&self, request: &CaptureRequest) -> Command {
        let camera = &self.camera;
        let mut cmd = match request {
            CaptureRequest::Photo { output } => {
                let mut cmd = Command::new(&camera.photo_tool);
                cmd.arg("-o")
                    .arg(output)
                    .args(["-t", &camera.photo_timeout_ms.to_string()])
                    .args(["-w", &camera.width.to_string()])
                    .args(["-h", &camera.height.to_string()])
                    .args(["-q", &camera.photo_quality.to_string()]);
                cmd
            }
            CaptureRequest::Video { output } => {
                let mut cmd = Command::new(&camera.video_tool);
                cmd.arg("-o")
                    .arg(output)
                    .args(["-t", "0"]) // record until stopped
                    .args(["-w", &camera.width.to_string()])
                    .args(["-h", &camera.height.to_string()])
                    .args(["-b", &camera.video_bitrate.to_string()]);
                cmd
            }
            CaptureRequest::Preview => {
                let mut cmd = Command::new(&camera.photo_tool);
                cmd.args(["-t", "0"]);
                if camera.fullscreen_preview {
                    cmd.arg("-f");
                }
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl CaptureBackend for RaspiBackend {
    fn name(&self) -> &'static str {
        "raspi"
    }

    async fn probe(&self) -> Result<()> {
        match which::which(&self.camera.photo_tool) {
            Ok(path) => info!("found {} at {}", self.camera.photo_tool, path.display()),
            Err(_) => {
                return Err(Error::HardwareUnavailable {
                    tool: self.camera.photo_tool.clone(),
                })
            }
        }
        if which::which(&self.camera.video_tool).is_err() {
            warn!(
                "{} not found; video recording will be unavailable",
                self.camera.video_tool
            );
        }
        Ok(())
    }

    async fn spawn(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureChild>> {
        let mut cmd = self.command_for(request);
        match cmd.spawn() {
            Ok(child) => {
                debug!("spawned {} process", request);
                Ok(Box::new(TokioChild { child }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("capture command for {} not found", request);
                Ok(Box::new(StillbornChild))
            }
            Err(err) => Err(Error::Io(err)),
        }
    }
}

#[derive(Debug)]
struct ActiveChild {
    request: CaptureRequest,
    child: Box<dyn CaptureChild>,
}

/// Owns the single active external capture process.
///
/// Spawn and wait are confined here so they never stall the input
/// listener's read loop or the disk monitor's timer.
#[derive(Debug)]
pub struct ProcessSupervisor {
    backend: Arc<dyn CaptureBackend>,
    active: Option<ActiveChild>,
    spawn_count: u64,
}

impl ProcessSupervisor {
    /// Create a supervisor over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            active: None,
            spawn_count: 0,
        }
    }

    /// Whether a process is currently active.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// The request the active process serves, if any.
    #[must_use]
    pub fn active_request(&self) -> Option<&CaptureRequest> {
        self.active.as_ref().map(|a| &a.request)
    }

    /// Total processes spawned since startup.
    #[must_use]
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count
    }

    /// Start a process for `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if a process is already active or spawning fails.
    pub async fn start(&mut self, request: CaptureRequest) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(Error::capture_process(format!(
                "cannot start {request}: {} already running",
                active.request
            )));
        }
        let child = self.backend.spawn(&request).await?;
        self.spawn_count += 1;
        info!("started {} process ({})", request, self.backend.name());
        self.active = Some(ActiveChild { request, child });
        Ok(())
    }

    /// Wait for the active process to exit and reap it.
    ///
    /// Cancel safe: if the wait is cancelled (e.g. by a timeout) the
    /// process stays active and can still be stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if no process is active or reaping fails.
    pub async fn wait_active(&mut self) -> Result<ExitOutcome> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| Error::internal("wait_active called with no active process"))?;
        let outcome = active.child.wait().await?;
        debug!("{} process exited: {:?}", active.request, outcome);
        self.active = None;
        Ok(outcome)
    }

    /// Reap the active process if it has already exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the status check fails.
    pub async fn try_reap(&mut self) -> Result<Option<ExitOutcome>> {
        let Some(active) = self.active.as_mut() else {
            return Ok(None);
        };
        match active.child.try_wait().await? {
            Some(outcome) => {
                debug!("{} process exited: {:?}", active.request, outcome);
                self.active = None;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    /// Stop the active process: graceful termination first, then force.
    ///
    /// Sends SIGTERM, waits up to `grace`, then SIGKILLs. The exit status
    /// is always reaped (bounded; `kill_on_drop` covers a truly wedged
    /// child).
    ///
    /// # Errors
    ///
    /// Returns an error only on status-reaping failures; a process that
    /// refuses SIGTERM is not an error.
    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome> {
        let Some(mut active) = self.active.take() else {
            return Ok(StopOutcome::NotRunning);
        };

        if let Err(err) = active.child.terminate() {
            warn!("termination request for {} failed: {err}", active.request);
        }

        match tokio::time::timeout(grace, active.child.wait()).await {
            Ok(outcome) => {
                let outcome = outcome?;
                info!("{} process stopped: {:?}", active.request, outcome);
                Ok(StopOutcome::Exited(outcome))
            }
            Err(_) => {
                warn!(
                    "{} process ignored SIGTERM after {:?}, killing",
                    active.request, grace
                );
                active.child.kill()?;
                let _ = tokio::time::timeout(KILL_REAP_TIMEOUT, active.child.wait()).await;
                Ok(StopOutcome::Killed)
            }
        }
    }
}

/// Kill stale capture tool processes left over from a previous crash.
///
/// Best effort: a failure here only means the tools may report the camera
/// busy on first use.
pub async fn sweep_stale_processes(tools: &[&str]) {
    for tool in tools {
        let result = Command::new("pkill")
            .args(["-9", "-x", tool])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => {
                warn!("killed stale {tool} processes from a previous run");
            }
            Ok(_) => {} // nothing matched
            Err(err) => debug!("stale process sweep for {tool} skipped: {err}"),
        }
    }
}
