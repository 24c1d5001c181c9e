//! Asynchronous media upload to a remote store.
//!
//! The upload worker consumes tasks from an in-process FIFO queue and pushes
//! completed media to a remote folder through an [`UploadTransport`].
//! Transient failures retry with capped exponential backoff; exhaustion marks
//! the task failed and deliberately retains the local file. Successful
//! uploads also retain the local copy: the remote store is best effort, the
//! local file is the durable record until an operator removes it.
//!
//! The pending queue is journaled to disk as JSON so uploads survive a
//! daemon restart.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Lifecycle state of an upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Queued,
    /// Currently being sent.
    Uploading,
    /// Accepted by the remote store.
    Succeeded,
    /// Gave up after exhausting retries or a fatal error.
    Failed,
}

impl TaskStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One pending or completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    /// Media file on the local disk.
    pub local_path: PathBuf,
    /// Remote folder that receives the file.
    pub remote_folder_id: String,
    /// Attempts made so far.
    pub attempt_count: u32,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Most recent error, if any.
    pub last_error: Option<String>,
    /// When the task entered the queue.
    pub enqueued_at: DateTime<Utc>,
}

impl UploadTask {
    /// Create a new queued task.
    #[must_use]
    pub fn new(local_path: PathBuf, remote_folder_id: impl Into<String>) -> Self {
        Self {
            local_path,
            remote_folder_id: remote_folder_id.into(),
            attempt_count: 0,
            status: TaskStatus::Queued,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }
}

/// Errors surfaced by an upload transport, classified for retry handling.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// Retryable: network hiccups, rate limiting.
    #[error("transient: {0}")]
    Transient(String),
    /// Not retryable: the task is marked failed, the local file retained.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Authentication problem: pauses the worker, not the daemon.
    #[error("auth: {0}")]
    Auth(String),
}

/// Access token for the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    /// Opaque token value.
    pub value: String,
    /// Absolute expiry time.
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Whether the token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Typed load/save of the persisted access token.
///
/// The token itself is obtained once through an external interactive flow;
/// the daemon only reads and rewrites the file.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Create a store at the given path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the token file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted token, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Option<AccessToken>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let token = serde_json::from_str(&contents)?;
        Ok(Some(token))
    }

    /// Persist a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, token: &AccessToken) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(token)?)?;
        Ok(())
    }
}

/// Capped exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts per task before it is marked failed.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt number
    /// `attempt` (zero-based): `base * 2^attempt`, capped.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1_u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// The full delay schedule between the configured attempts.
    #[must_use]
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_for(attempt))
            .collect()
    }
}

/// Transport to the remote upload service.
///
/// Mirrors the collaborator contract: authenticate, refresh, upload, with
/// errors pre-classified as retryable or fatal.
#[async_trait::async_trait]
pub trait UploadTransport: Send + Sync + std::fmt::Debug {
    /// Obtain a usable token. The interactive first-time flow runs out of
    /// band; this picks up its persisted result.
    async fn authenticate(&self) -> std::result::Result<AccessToken, TransportError>;

    /// Refresh an expired token.
    async fn refresh(
        &self,
        token: &AccessToken,
    ) -> std::result::Result<AccessToken, TransportError>;

    /// Upload a file into a remote folder, returning the remote id.
    async fn upload(
        &self,
        token: &AccessToken,
        folder_id: &str,
        local_path: &Path,
    ) -> std::result::Result<String, TransportError>;
}

/// Transport that shells out to an external uploader command.
///
/// Expected tool contract: `<tool> refresh --token-file <path>` rewrites the
/// token file; `<tool> upload --token-file <path> --folder <id> <local>`
/// prints the remote id on stdout. Exit code 75 (`EX_TEMPFAIL`) marks a
/// retryable failure, any other non-zero exit is fatal.
#[derive(Debug)]
pub struct CommandTransport {
    program: String,
    token_store: TokenStore,
}

impl CommandTransport {
    /// Create a transport for the given uploader tool and token file.
    #[must_use]
    pub fn new(program: impl Into<String>, token_path: PathBuf) -> Self {
        Self {
            program: program.into(),
            token_store: TokenStore::new(token_path),
        }
    }

    fn load_token(&self) -> std::result::Result<AccessToken, TransportError> {
        match self.token_store.load() {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(TransportError::Auth(format!(
                "no token at {}; run `{} login --token-file {}` once",
                self.token_store.path().display(),
                self.program,
                self.token_store.path().display(),
            ))),
            Err(err) => Err(TransportError::Auth(format!("token unreadable: {err}"))),
        }
    }
}

#[async_trait::async_trait]
impl UploadTransport for CommandTransport {
    async fn authenticate(&self) -> std::result::Result<AccessToken, TransportError> {
        self.load_token()
    }

    async fn refresh(
        &self,
        _token: &AccessToken,
    ) -> std::result::Result<AccessToken, TransportError> {
        let status = tokio::process::Command::new(&self.program)
            .arg("refresh")
            .arg("--token-file")
            .arg(self.token_store.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|err| TransportError::Auth(format!("refresh failed to run: {err}")))?;
        if !status.success() {
            return Err(TransportError::Auth(format!(
                "token refresh exited with {status}"
            )));
        }
        self.load_token()
    }

    async fn upload(
        &self,
        _token: &AccessToken,
        folder_id: &str,
        local_path: &Path,
    ) -> std::result::Result<String, TransportError> {
        let output = tokio::process::Command::new(&self.program)
            .arg("upload")
            .arg("--token-file")
            .arg(self.token_store.path())
            .arg("--folder")
            .arg(folder_id)
            .arg(local_path)
            .stdin(Stdio::null())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransportError::Fatal(format!(
                    "uploader tool '{}' not found",
                    self.program
                )));
            }
            Err(err) => return Err(TransportError::Transient(err.to_string())),
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            // EX_TEMPFAIL per sysexits
            Some(75) => Err(TransportError::Transient(stderr)),
            Some(code) => Err(TransportError::Fatal(format!("exit {code}: {stderr}"))),
            None => Err(TransportError::Transient("uploader killed".to_string())),
        }
    }
}

/// Paths referenced by non-terminal upload tasks.
///
/// Shared with the disk monitor so cleanup never deletes a file that is
/// still waiting to be uploaded.
#[derive(Debug, Clone, Default)]
pub struct ProtectedPaths {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ProtectedPaths {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect a path.
    pub fn insert(&self, path: PathBuf) {
        self.inner.lock().expect("protected path lock").insert(path);
    }

    /// Release a path.
    pub fn remove(&self, path: &Path) {
        self.inner.lock().expect("protected path lock").remove(path);
    }

    /// Whether a path is protected.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .expect("protected path lock")
            .contains(path)
    }

    /// Number of protected paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("protected path lock").len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSON journal of the pending queue.
#[derive(Debug, Clone)]
pub struct QueueJournal {
    path: PathBuf,
}

impl QueueJournal {
    /// Create a journal at the given path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load pending tasks from a previous run.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal exists but cannot be read or parsed.
    pub fn load(&self) -> Result<VecDeque<UploadTask>> {
        if !self.path.exists() {
            return Ok(VecDeque::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let tasks: Vec<UploadTask> = serde_json::from_str(&contents)?;
        Ok(tasks.into())
    }

    /// Persist the pending tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be written.
    pub fn store(&self, tasks: &VecDeque<UploadTask>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let tasks: Vec<&UploadTask> = tasks.iter().collect();
        std::fs::write(&self.path, serde_json::to_string_pretty(&tasks)?)?;
        Ok(())
    }
}

/// Read-mostly snapshot of upload worker state for the status reporter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadStats {
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Whether a task is currently being sent.
    pub uploading: bool,
    /// Tasks accepted by the remote store since startup.
    pub succeeded: u64,
    /// Tasks given up on since startup.
    pub failed: u64,
    /// Enqueue time of the oldest pending task.
    pub oldest_pending: Option<DateTime<Utc>>,
    /// Worker is paused waiting for authentication to recover.
    pub paused: bool,
}

impl UploadStats {
    /// Derive counters from a journaled task list, for offline status
    /// reports where no worker is publishing live stats.
    #[must_use]
    pub fn from_tasks(tasks: &VecDeque<UploadTask>) -> Self {
        let mut stats = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Succeeded => stats.succeeded += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Queued | TaskStatus::Uploading => {
                    stats.queued += 1;
                    let enqueued = task.enqueued_at;
                    stats.oldest_pending = Some(match stats.oldest_pending {
                        Some(existing) if existing <= enqueued => existing,
                        _ => enqueued,
                    });
                }
            }
        }
        stats
    }
}

/// Sender half used by the controller to enqueue completed media.
#[derive(Debug, Clone)]
pub struct UploadQueue {
    tx: mpsc::Sender<UploadTask>,
    protected: ProtectedPaths,
}

impl UploadQueue {
    /// Create a queue handle.
    #[must_use]
    pub fn new(tx: mpsc::Sender<UploadTask>, protected: ProtectedPaths) -> Self {
        Self { tx, protected }
    }

    /// Enqueue a task, protecting its file from cleanup until the task
    /// reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has shut down.
    pub async fn enqueue(&self, task: UploadTask) -> Result<()> {
        self.protected.insert(task.local_path.clone());
        self.tx
            .send(task)
            .await
            .map_err(|_| Error::internal("upload worker is gone"))
    }
}

/// The upload worker task.
#[derive(Debug)]
pub struct UploadWorker {
    rx: mpsc::Receiver<UploadTask>,
    transport: Arc<dyn UploadTransport>,
    token_store: TokenStore,
    policy: RetryPolicy,
    auth_retry: Duration,
    protected: ProtectedPaths,
    journal: QueueJournal,
    stats_tx: watch::Sender<UploadStats>,
    token: Option<AccessToken>,
    succeeded: u64,
    failed: u64,
}

impl UploadWorker {
    /// Create a worker consuming from `rx`.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        rx: mpsc::Receiver<UploadTask>,
        transport: Arc<dyn UploadTransport>,
        token_store: TokenStore,
        policy: RetryPolicy,
        auth_retry: Duration,
        protected: ProtectedPaths,
        journal: QueueJournal,
        stats_tx: watch::Sender<UploadStats>,
    ) -> Self {
        Self {
            rx,
            transport,
            token_store,
            policy,
            auth_retry,
            protected,
            journal,
            stats_tx,
            token: None,
            succeeded: 0,
            failed: 0,
        }
    }

    /// Run until the queue sender is dropped. Tasks journaled by a previous
    /// run are recovered first.
    pub async fn run(mut self) {
        let mut pending = match self.journal.load() {
            Ok(pending) => pending,
            Err(err) => {
                warn!("upload journal unreadable, starting empty: {err}");
                VecDeque::new()
            }
        };
        if !pending.is_empty() {
            info!("recovered {} pending uploads from journal", pending.len());
            for task in &pending {
                self.protected.insert(task.local_path.clone());
            }
        }
        self.publish(&pending, false, false);

        loop {
            if pending.is_empty() {
                match self.rx.recv().await {
                    Some(task) => pending.push_back(task),
                    None => break,
                }
            }
            // Pick up anything else already queued so the journal stays
            // complete across a crash.
            while let Ok(task) = self.rx.try_recv() {
                pending.push_back(task);
            }
            if let Err(err) = self.journal.store(&pending) {
                warn!("failed to write upload journal: {err}");
            }

            let Some(task) = pending.pop_front() else {
                continue;
            };
            self.publish(&pending, true, false);
            let task = self.process_task(task, &pending).await;
            self.protected.remove(&task.local_path);
            if let Err(err) = self.journal.store(&pending) {
                warn!("failed to write upload journal: {err}");
            }
            self.publish(&pending, false, false);
        }

        if let Err(err) = self.journal.store(&pending) {
            warn!("failed to write upload journal at shutdown: {err}");
        }
        debug!("upload worker stopped");
    }

    /// Drive one task to a terminal state.
    async fn process_task(
        &mut self,
        mut task: UploadTask,
        pending: &VecDeque<UploadTask>,
    ) -> UploadTask {
        task.status = TaskStatus::Uploading;
        loop {
            let token = match self.ensure_token().await {
                Ok(token) => token,
                Err(TransportError::Auth(reason)) => {
                    self.pause_for_auth(&reason, pending).await;
                    continue;
                }
                Err(err) => {
                    // Treat unexpected classifications from the token path
                    // like transient upload failures.
                    warn!("token acquisition failed: {err}");
                    self.pause_for_auth(&err.to_string(), pending).await;
                    continue;
                }
            };

            match self
                .transport
                .upload(&token, &task.remote_folder_id, &task.local_path)
                .await
            {
                Ok(remote_id) => {
                    info!(
                        "uploaded {} as {remote_id} (local copy retained)",
                        task.local_path.display()
                    );
                    task.status = TaskStatus::Succeeded;
                    self.succeeded += 1;
                    return task;
                }
                Err(TransportError::Transient(message)) => {
                    task.attempt_count += 1;
                    task.last_error = Some(message.clone());
                    if task.attempt_count >= self.policy.max_attempts {
                        warn!(
                            "upload of {} failed after {} attempts: {message}; local file retained",
                            task.local_path.display(),
                            task.attempt_count
                        );
                        task.status = TaskStatus::Failed;
                        self.failed += 1;
                        return task;
                    }
                    let delay = self.policy.delay_for(task.attempt_count - 1);
                    debug!(
                        "transient upload failure (attempt {}), retrying in {:?}: {message}",
                        task.attempt_count, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(TransportError::Fatal(message)) => {
                    warn!(
                        "upload of {} failed permanently: {message}; local file retained",
                        task.local_path.display()
                    );
                    task.attempt_count += 1;
                    task.last_error = Some(message);
                    task.status = TaskStatus::Failed;
                    self.failed += 1;
                    return task;
                }
                Err(TransportError::Auth(reason)) => {
                    // Token was rejected mid-flight; drop the cached value
                    // and pause until authentication recovers.
                    self.token = None;
                    self.pause_for_auth(&reason, pending).await;
                }
            }
        }
    }

    /// Return a valid token, loading, authenticating or refreshing as
    /// needed.
    async fn ensure_token(&mut self) -> std::result::Result<AccessToken, TransportError> {
        let now = Utc::now();
        if self.token.is_none() {
            match self.token_store.load() {
                Ok(stored) => self.token = stored,
                Err(err) => warn!("persisted token unreadable: {err}"),
            }
        }
        let cached = self.token.clone();
        let token = match cached {
            Some(token) if !token.is_expired(now) => token,
            Some(expired) => {
                debug!("access token expired, refreshing");
                let refreshed = self.transport.refresh(&expired).await?;
                if let Err(err) = self.token_store.save(&refreshed) {
                    warn!("failed to persist refreshed token: {err}");
                }
                refreshed
            }
            None => {
                let token = self.transport.authenticate().await?;
                if let Err(err) = self.token_store.save(&token) {
                    warn!("failed to persist token: {err}");
                }
                token
            }
        };
        self.token = Some(token.clone());
        Ok(token)
    }

    /// Pause the worker (only) until the next auth retry slot.
    async fn pause_for_auth(&mut self, reason: &str, pending: &VecDeque<UploadTask>) {
        warn!("upload worker paused, auth required: {reason}");
        self.publish(pending, true, true);
        tokio::time::sleep(self.auth_retry).await;
        self.publish(pending, true, false);
    }

    fn publish(&self, pending: &VecDeque<UploadTask>, uploading: bool, paused: bool) {
        let _ = self.stats_tx.send(UploadStats {
            queued: pending.len(),
            uploading,
            succeeded: self.succeeded,
            failed: self.failed,
            oldest_pending: pending.front().map(|task| task.enqueued_at),
            paused,
        });
    }
}
