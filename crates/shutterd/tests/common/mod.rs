//! Shared fixtures for integration tests.
//!
//! Provides a capture backend that fabricates media files instead of
//! invoking camera tools, and a controller rig wired the way the daemon
//! wires it, minus the terminal and the real disk probe.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};

use shutterd::controller::{Controller, ControllerHandles};
use shutterd::disk::DiskState;
use shutterd::error::Result;
use shutterd::input::Command;
use shutterd::supervisor::{
    CaptureBackend, CaptureChild, CaptureRequest, ExitOutcome, ProcessSupervisor,
};
use shutterd::upload::ProtectedPaths;
use shutterd::Config;

/// Backend whose children write their output file instead of driving a
/// camera. Photo children exit immediately; video and preview children
/// run until terminated.
#[derive(Debug, Default)]
pub struct MockBackend {
    pub spawns: Arc<AtomicU64>,
}

#[derive(Debug)]
struct MockChild {
    long_running: bool,
    terminated: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl CaptureChild for MockChild {
    async fn wait(&mut self) -> Result<ExitOutcome> {
        if self.long_running {
            while !self.terminated.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        Ok(ExitOutcome::Success)
    }

    async fn try_wait(&mut self) -> Result<Option<ExitOutcome>> {
        if self.long_running && !self.terminated.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            Ok(Some(ExitOutcome::Success))
        }
    }

    fn terminate(&mut self) -> Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait::async_trait]
impl CaptureBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn spawn(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureChild>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if let Some(output) = request.output() {
            std::fs::write(output, b"media")?;
        }
        Ok(Box::new(MockChild {
            long_running: request.is_long_running(),
            terminated: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Config pointed into a tempdir, with short timeouts and uploads off.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.output_dir = Some(root.to_path_buf());
    config.upload.enabled = false;
    config.upload.journal_path = Some(root.join("upload-queue.json"));
    config.upload.token_path = Some(root.join("upload-token.json"));
    config.camera.photo_timeout_ms = 10;
    config.daemon.stop_grace_secs = 1;
    config.daemon.preview_grace_secs = 1;
    config
}

/// A controller plus the handles tests poke at.
pub struct TestRig {
    pub controller: Controller,
    pub disk_tx: watch::Sender<DiskState>,
    pub cmd_tx: mpsc::Sender<Command>,
    pub spawns: Arc<AtomicU64>,
    pub protected: ProtectedPaths,
}

/// Build a controller over the mock backend.
pub fn rig(config: &Config) -> TestRig {
    let backend = MockBackend::default();
    let spawns = Arc::clone(&backend.spawns);
    rig_with_backend(config, Arc::new(backend), spawns)
}

/// Build a controller over a caller-supplied backend. `spawns` is whatever
/// counter the backend increments, or a fresh zero for backends that don't.
pub fn rig_with_backend(
    config: &Config,
    backend: Arc<dyn CaptureBackend>,
    spawns: Arc<AtomicU64>,
) -> TestRig {
    std::fs::create_dir_all(config.photos_dir()).expect("photos dir");
    std::fs::create_dir_all(config.videos_dir()).expect("videos dir");

    let supervisor = ProcessSupervisor::new(backend);

    let (cmd_tx, cmd_rx) = mpsc::channel(config.daemon.command_channel_capacity);
    let (disk_tx, disk_rx) = watch::channel(DiskState::default());
    let protected = ProtectedPaths::new();

    let controller = Controller::new(
        config.clone(),
        supervisor,
        ControllerHandles {
            commands: cmd_rx,
            disk: disk_rx,
            upload_queue: None,
            upload_stats: None,
            admission: Arc::new(Mutex::new(())),
            protected: protected.clone(),
            raw: None,
            input_suspended: Arc::new(AtomicBool::new(false)),
            dropped_keys: Arc::new(AtomicU64::new(0)),
        },
    );

    TestRig {
        controller,
        disk_tx,
        cmd_tx,
        spawns,
        protected,
    }
}

/// Count files with the given extension in a directory.
pub fn count_files(dir: &Path, extension: &str) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(std::result::Result::ok)
                .filter(|entry| {
                    entry
                        .path()
                        .extension()
                        .is_some_and(|ext| ext == extension)
                })
                .count()
        })
        .unwrap_or(0)
}
