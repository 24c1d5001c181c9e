//! The capture controller.
//!
//! Single-writer command loop that owns all capture state. Keystroke
//! commands arrive over a bounded channel; the controller admits or vetoes
//! them against the current state and the disk watermark, drives the
//! process supervisor, and hands completed media to the upload queue.
//! Photo capture and disk cleanup contend on a shared admission lock so a
//! cleanup pass never races a file being written.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::disk::DiskState;
use crate::error::Result;
use crate::input::{Command, RawModeGuard};
use crate::session::{
    timestamp_stem, unique_output_path, CaptureKind, CaptureSession, SessionStatus,
};
use crate::status::StatusSnapshot;
use crate::supervisor::{CaptureRequest, ProcessSupervisor};
use crate::upload::{ProtectedPaths, UploadQueue, UploadStats, UploadTask};

/// Poll interval of the command loop when no command is pending. Bounds how
/// late a spontaneous process exit is noticed.
const TICK: Duration = Duration::from_millis(250);

/// Slack added to the photo tool's own exposure time before the controller
/// gives up waiting and stops the process.
const PHOTO_WAIT_MARGIN: Duration = Duration::from_secs(10);

/// Observable lifecycle state of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// No capture process running.
    Idle,
    /// Live preview running.
    Preview,
    /// A photo capture is in flight.
    CapturingPhoto,
    /// A video recording is in progress.
    Recording,
    /// The terminal is handed to an interactive shell.
    Suspended,
    /// Quit accepted; teardown in progress.
    ShuttingDown,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Preview => write!(f, "preview"),
            Self::CapturingPhoto => write!(f, "capturing photo"),
            Self::Recording => write!(f, "recording"),
            Self::Suspended => write!(f, "suspended"),
            Self::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// The controller task.
#[derive(Debug)]
pub struct Controller {
    config: Config,
    supervisor: ProcessSupervisor,
    rx: mpsc::Receiver<Command>,
    disk_rx: watch::Receiver<DiskState>,
    upload_queue: Option<UploadQueue>,
    upload_stats_rx: Option<watch::Receiver<UploadStats>>,
    admission: Arc<Mutex<()>>,
    protected: ProtectedPaths,
    raw: Option<RawModeGuard>,
    input_suspended: Arc<AtomicBool>,
    dropped_keys: Arc<AtomicU64>,
    state: DaemonState,
    // Whether the operator wants the preview up; it is paused around
    // photos, videos and shells and restored afterwards.
    preview_desired: bool,
    recording: Option<CaptureSession>,
    last_session: Option<CaptureSession>,
    photos_taken: u64,
    videos_recorded: u64,
}

/// Everything the controller needs besides the config and supervisor.
///
/// Groups the channel ends and shared handles so construction sites stay
/// readable.
#[derive(Debug)]
pub struct ControllerHandles {
    /// Keystroke command receiver.
    pub commands: mpsc::Receiver<Command>,
    /// Disk state published by the monitor.
    pub disk: watch::Receiver<DiskState>,
    /// Upload enqueue handle, absent when uploads are disabled.
    pub upload_queue: Option<UploadQueue>,
    /// Live upload stats, absent when uploads are disabled.
    pub upload_stats: Option<watch::Receiver<UploadStats>>,
    /// Admission lock shared with the disk monitor's cleanup.
    pub admission: Arc<Mutex<()>>,
    /// Paths cleanup must not delete.
    pub protected: ProtectedPaths,
    /// Raw mode guard, absent when not attached to a tty.
    pub raw: Option<RawModeGuard>,
    /// Flag that pauses the key reader during shell suspension.
    pub input_suspended: Arc<AtomicBool>,
    /// Counter of keystrokes dropped by the reader.
    pub dropped_keys: Arc<AtomicU64>,
}

impl Controller {
    /// Create a controller.
    #[must_use]
    pub fn new(config: Config, supervisor: ProcessSupervisor, handles: ControllerHandles) -> Self {
        Self {
            config,
            supervisor,
            rx: handles.commands,
            disk_rx: handles.disk,
            upload_queue: handles.upload_queue,
            upload_stats_rx: handles.upload_stats,
            admission: handles.admission,
            protected: handles.protected,
            raw: handles.raw,
            input_suspended: handles.input_suspended,
            dropped_keys: handles.dropped_keys,
            state: DaemonState::Idle,
            preview_desired: false,
            recording: None,
            last_session: None,
            photos_taken: 0,
            videos_recorded: 0,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Photos captured since startup.
    #[must_use]
    pub fn photos_taken(&self) -> u64 {
        self.photos_taken
    }

    /// Videos recorded since startup.
    #[must_use]
    pub fn videos_recorded(&self) -> u64 {
        self.videos_recorded
    }

    /// The most recently finished capture session, if any.
    #[must_use]
    pub fn last_session(&self) -> Option<&CaptureSession> {
        self.last_session.as_ref()
    }

    /// Run the command loop until quit or channel closure.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable internal failures; capture
    /// process failures are logged and absorbed.
    pub async fn run(mut self) -> Result<()> {
        info!("controller ready (space=photo v=video p=preview s=status h=shell q=quit)");
        loop {
            match tokio::time::timeout(TICK, self.rx.recv()).await {
                Ok(Some(command)) => {
                    if self.handle_command(command).await?.is_break() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("command channel closed");
                    self.shutdown().await?;
                    break;
                }
                Err(_) => self.tick().await?,
            }
        }
        Ok(())
    }

    /// Dispatch one command. Public so scenario tests can step the
    /// controller deterministically.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable internal failures.
    pub async fn handle_command(&mut self, command: Command) -> Result<ControlFlow<()>> {
        debug!("command: {command} (state: {})", self.state);
        match command {
            Command::Photo => self.capture_photo().await?,
            Command::ToggleVideo => self.toggle_video().await?,
            Command::TogglePreview => self.toggle_preview().await?,
            Command::Shell => self.suspend_into_shell().await?,
            Command::Status => self.report_status(),
            Command::Quit => {
                self.shutdown().await?;
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Periodic housekeeping: notice spontaneous process exits.
    async fn tick(&mut self) -> Result<()> {
        let request = self.supervisor.active_request().cloned();
        let Some(outcome) = self.supervisor.try_reap().await? else {
            return Ok(());
        };
        match request {
            Some(CaptureRequest::Video { .. }) => {
                warn!("recording process exited on its own: {outcome:?}");
                self.finish_recording(outcome.is_success()).await;
                self.state = DaemonState::Idle;
                self.restore_preview().await;
            }
            Some(CaptureRequest::Preview) => {
                warn!("preview process exited on its own: {outcome:?}");
                self.preview_desired = false;
                self.state = DaemonState::Idle;
            }
            _ => {}
        }
        Ok(())
    }

    fn disk_veto(&self) -> bool {
        let disk = *self.disk_rx.borrow();
        if disk.is_critical() {
            warn!(
                "capture vetoed: disk critical ({} MB free)",
                disk.free_bytes / (1024 * 1024)
            );
            return true;
        }
        false
    }

    async fn capture_photo(&mut self) -> Result<()> {
        if self.state == DaemonState::Recording {
            warn!("photo ignored while recording");
            return Ok(());
        }
        if self.disk_veto() {
            return Ok(());
        }

        let admission = Arc::clone(&self.admission);
        let guard = admission.lock().await;

        let preview_was_up = self.pause_preview().await;

        let dir = self.config.photos_dir();
        let stem = timestamp_stem(chrono::Local::now());
        let output = unique_output_path(&dir, &stem, CaptureKind::Photo.extension());
        let mut session = CaptureSession::new(CaptureKind::Photo, output.clone());
        self.protected.insert(output.clone());

        session.status = SessionStatus::Running;
        self.state = DaemonState::CapturingPhoto;
        let wait_budget = Duration::from_millis(self.config.camera.photo_timeout_ms)
            + PHOTO_WAIT_MARGIN;
        let completed = self.run_photo_process(output.clone(), wait_budget).await;
        self.state = DaemonState::Idle;

        if completed && output.exists() {
            session.status = SessionStatus::Completed;
            self.photos_taken += 1;
            info!("photo saved: {}", output.display());
            self.enqueue_upload(output.clone()).await;
        } else {
            session.status = SessionStatus::Failed;
            self.protected.remove(&output);
            error!("photo capture failed");
        }
        debug!("session: {}", session.summary());
        self.last_session = Some(session);

        drop(guard);
        if preview_was_up {
            self.restore_preview().await;
        }
        Ok(())
    }

    /// Spawn the photo process and wait for it, stopping it if it overruns
    /// its budget. Returns whether it exited successfully.
    async fn run_photo_process(&mut self, output: PathBuf, wait_budget: Duration) -> bool {
        if let Err(err) = self
            .supervisor
            .start(CaptureRequest::Photo { output })
            .await
        {
            error!("photo spawn failed: {err}");
            return false;
        }
        match tokio::time::timeout(wait_budget, self.supervisor.wait_active()).await {
            Ok(Ok(outcome)) => outcome.is_success(),
            Ok(Err(err)) => {
                error!("photo wait failed: {err}");
                false
            }
            Err(_) => {
                warn!("photo process overran {wait_budget:?}");
                let _ = self.supervisor.stop(self.config.stop_grace()).await;
                false
            }
        }
    }

    async fn toggle_video(&mut self) -> Result<()> {
        if self.state == DaemonState::Recording {
            return self.stop_video().await;
        }
        if self.disk_veto() {
            return Ok(());
        }

        let admission = Arc::clone(&self.admission);
        let guard = admission.lock().await;

        self.pause_preview().await;

        let dir = self.config.videos_dir();
        let stem = timestamp_stem(chrono::Local::now());
        let output = unique_output_path(&dir, &stem, CaptureKind::Video.extension());
        let mut session = CaptureSession::new(CaptureKind::Video, output.clone());
        self.protected.insert(output.clone());

        match self
            .supervisor
            .start(CaptureRequest::Video {
                output: output.clone(),
            })
            .await
        {
            Ok(()) => {
                session.status = SessionStatus::Running;
                self.recording = Some(session);
                self.state = DaemonState::Recording;
                info!("recording started: {}", output.display());
            }
            Err(err) => {
                self.protected.remove(&output);
                error!("recording spawn failed: {err}");
                drop(guard);
                self.restore_preview().await;
            }
        }
        Ok(())
    }

    async fn stop_video(&mut self) -> Result<()> {
        // A recording stopped by SIGTERM or even SIGKILL still counts; the
        // file-existence check in finish_recording is what decides. A reap
        // failure must not skip that accounting.
        if let Err(err) = self.supervisor.stop(self.config.stop_grace()).await {
            warn!("recording stop failed: {err}");
        }
        self.finish_recording(true).await;
        self.state = DaemonState::Idle;
        self.restore_preview().await;
        Ok(())
    }

    /// Close out the current recording session. A recording counts as
    /// produced if its file exists, even when the process had to be killed;
    /// the container is raw H.264 and truncation loses only the tail.
    async fn finish_recording(&mut self, process_ok: bool) {
        let Some(mut session) = self.recording.take() else {
            return;
        };
        let output = session.output_path.clone();
        if process_ok && output.exists() {
            session.status = SessionStatus::Completed;
            self.videos_recorded += 1;
            info!("recording saved: {}", output.display());
            self.enqueue_upload(output).await;
        } else {
            session.status = SessionStatus::Failed;
            self.protected.remove(&output);
            error!("recording failed: {}", output.display());
        }
        debug!("session: {}", session.summary());
        self.last_session = Some(session);
    }

    async fn toggle_preview(&mut self) -> Result<()> {
        match self.state {
            DaemonState::Recording => {
                warn!("preview unavailable while recording");
            }
            DaemonState::Preview => {
                self.preview_desired = false;
                let _ = self.supervisor.stop(self.config.preview_grace()).await?;
                self.state = DaemonState::Idle;
                info!("preview stopped");
            }
            _ => {
                self.preview_desired = true;
                self.start_preview().await;
            }
        }
        Ok(())
    }

    async fn start_preview(&mut self) {
        match self.supervisor.start(CaptureRequest::Preview).await {
            Ok(()) => {
                self.state = DaemonState::Preview;
                info!("preview started");
            }
            Err(err) => {
                self.preview_desired = false;
                error!("preview spawn failed: {err}");
            }
        }
    }

    /// Stop a running preview. Returns whether one was up.
    async fn pause_preview(&mut self) -> bool {
        if self.state != DaemonState::Preview {
            return false;
        }
        match self.supervisor.stop(self.config.preview_grace()).await {
            Ok(_) => {}
            Err(err) => warn!("preview stop failed: {err}"),
        }
        self.state = DaemonState::Idle;
        true
    }

    /// Restart the preview if the operator had it on.
    async fn restore_preview(&mut self) {
        if self.preview_desired && self.state == DaemonState::Idle {
            self.start_preview().await;
        }
    }

    /// Hand the terminal to an interactive shell and wait for it to exit.
    ///
    /// The key reader is paused and raw mode released for the duration. A
    /// running recording is left alone; only the preview is paused so the
    /// camera stack doesn't fight over the display.
    async fn suspend_into_shell(&mut self) -> Result<()> {
        let preview_was_up = self.pause_preview().await;
        let prior_state = self.state;
        self.state = DaemonState::Suspended;
        self.input_suspended.store(true, Ordering::Release);
        if let Some(raw) = &mut self.raw {
            raw.suspend()?;
        }

        info!("suspending into {}; exit the shell to return", self.config.daemon.shell);
        let status = tokio::process::Command::new(&self.config.daemon.shell)
            .status()
            .await;
        match status {
            Ok(status) => debug!("shell exited: {status}"),
            Err(err) => error!("failed to launch shell: {err}"),
        }

        if let Some(raw) = &mut self.raw {
            raw.resume()?;
        }
        self.input_suspended.store(false, Ordering::Release);
        self.state = prior_state;
        if preview_was_up {
            self.restore_preview().await;
        }
        Ok(())
    }

    fn report_status(&mut self) {
        let mut snapshot = match StatusSnapshot::gather(&self.config) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("status gather failed: {err}");
                StatusSnapshot::default()
            }
        };
        snapshot.recording = self.state == DaemonState::Recording;
        snapshot.preview_active = self.state == DaemonState::Preview;
        snapshot.last_session = self.last_session.clone();
        snapshot.photos_taken = self.photos_taken;
        snapshot.videos_recorded = self.videos_recorded;
        snapshot.dropped_keys = self.dropped_keys.load(Ordering::Relaxed);
        if let Some(stats_rx) = &self.upload_stats_rx {
            snapshot.upload = stats_rx.borrow().clone();
        }
        print!("{}", snapshot.render());
        use std::io::Write as _;
        let _ = std::io::stdout().flush();
    }

    /// Stop whatever is running and close out state.
    async fn shutdown(&mut self) -> Result<()> {
        info!("shutting down");
        self.state = DaemonState::ShuttingDown;
        if let Err(err) = self.supervisor.stop(self.config.stop_grace()).await {
            warn!("stop during shutdown failed: {err}");
        }
        self.finish_recording(true).await;
        Ok(())
    }

    async fn enqueue_upload(&mut self, path: PathBuf) {
        let Some(queue) = &self.upload_queue else {
            self.protected.remove(&path);
            return;
        };
        let task = UploadTask::new(path.clone(), self.config.upload.remote_folder_id.clone());
        if let Err(err) = queue.enqueue(task).await {
            warn!("upload enqueue failed for {}: {err}", path.display());
            self.protected.remove(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_state_display() {
        assert_eq!(DaemonState::Idle.to_string(), "idle");
        assert_eq!(DaemonState::CapturingPhoto.to_string(), "capturing photo");
        assert_eq!(DaemonState::Recording.to_string(), "recording");
        assert_eq!(DaemonState::ShuttingDown.to_string(), "shutting down");
    }
}
