//! Daemon assembly and lifecycle.
//!
//! Wires the key reader, controller, disk monitor and upload worker
//! together, runs until the operator quits or a termination signal
//! arrives, then tears everything down within a bounded shutdown window.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::controller::{Controller, ControllerHandles};
use crate::disk::{DiskMonitor, DiskState, StatvfsProbe};
use crate::error::{Error, Result};
use crate::input::{Command, InputReader, RawModeGuard};
use crate::supervisor::{sweep_stale_processes, CaptureBackend, ProcessSupervisor, RaspiBackend};
use crate::upload::{
    CommandTransport, QueueJournal, RetryPolicy, TokenStore, UploadQueue, UploadStats,
    UploadWorker,
};

/// Capacity of the internal upload task channel. Decoupled from the key
/// command channel; enqueue backpressure here only delays the controller
/// briefly, it never drops media.
const UPLOAD_CHANNEL_CAPACITY: usize = 64;

/// Run the daemon until quit.
///
/// # Errors
///
/// Returns an error when startup preconditions fail, notably when the
/// photo capture tool is absent, or when the controller hits an
/// unrecoverable internal failure.
pub async fn run(config: Config) -> Result<()> {
    for dir in [config.photos_dir(), config.videos_dir()] {
        std::fs::create_dir_all(&dir).map_err(|source| Error::DirectoryCreate {
            path: dir.clone(),
            source,
        })?;
    }

    let backend: Arc<dyn CaptureBackend> = Arc::new(RaspiBackend::new(config.camera.clone()));
    backend.probe().await?;
    sweep_stale_processes(&[&config.camera.photo_tool, &config.camera.video_tool]).await;

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(config.daemon.command_channel_capacity);
    let (disk_tx, disk_rx) = watch::channel(DiskState::default());
    let admission = Arc::new(Mutex::new(()));
    let protected = crate::upload::ProtectedPaths::new();

    // Upload worker, when enabled.
    let (upload_queue, upload_stats, upload_handle) = if config.upload.enabled {
        let (task_tx, task_rx) = mpsc::channel(UPLOAD_CHANNEL_CAPACITY);
        let (stats_tx, stats_rx) = watch::channel(UploadStats::default());
        let transport = Arc::new(CommandTransport::new(
            config.upload.uploader_tool.clone(),
            config.token_path(),
        ));
        let worker = UploadWorker::new(
            task_rx,
            transport,
            TokenStore::new(config.token_path()),
            RetryPolicy {
                max_attempts: config.upload.max_attempts,
                base_delay_ms: config.upload.base_delay_ms,
                max_delay_ms: config.upload.max_delay_ms,
            },
            Duration::from_secs(config.upload.auth_retry_secs),
            protected.clone(),
            QueueJournal::new(config.journal_path()),
            stats_tx,
        );
        let handle = tokio::spawn(worker.run());
        (
            Some(UploadQueue::new(task_tx, protected.clone())),
            Some(stats_rx),
            Some(handle),
        )
    } else {
        info!("uploads disabled");
        (None, None, None)
    };

    let monitor = DiskMonitor::new(
        config.photos_dir(),
        config.videos_dir(),
        config.low_water_bytes(),
        config.critical_water_bytes(),
        config.check_interval(),
        config.storage.max_photos,
        config.storage.max_videos,
        Arc::new(StatvfsProbe),
        disk_tx,
        Arc::clone(&admission),
        protected.clone(),
    );
    let monitor_handle = tokio::spawn(monitor.run());

    // Terminal input. A missing tty is not fatal: signals can still drive
    // shutdown and the daemon stays useful under a supervisor.
    RawModeGuard::install_panic_hook();
    let raw = match RawModeGuard::new() {
        Ok(guard) => Some(guard),
        Err(err) => {
            warn!("raw mode unavailable ({err}); keyboard control disabled");
            None
        }
    };
    let input_suspended = Arc::new(AtomicBool::new(false));
    let reader = InputReader::new(cmd_tx.clone(), Arc::clone(&input_suspended));
    let dropped_keys = reader.dropped_counter();
    let input_handle = tokio::task::spawn_blocking(move || reader.run());

    let signal_handle = spawn_signal_listener(cmd_tx);

    let supervisor = ProcessSupervisor::new(backend);
    let controller = Controller::new(
        config.clone(),
        supervisor,
        ControllerHandles {
            commands: cmd_rx,
            disk: disk_rx,
            upload_queue,
            upload_stats,
            admission,
            protected,
            raw,
            input_suspended,
            dropped_keys,
        },
    );
    let result = controller.run().await;

    // Teardown. Dropping the controller dropped the last upload sender, so
    // the worker drains its queue journal and exits; give it a bounded
    // window rather than waiting out a long retry schedule.
    signal_handle.abort();
    monitor_handle.abort();
    if let Some(handle) = upload_handle {
        if tokio::time::timeout(config.shutdown_timeout(), handle)
            .await
            .is_err()
        {
            warn!("upload worker did not stop in time; pending tasks remain journaled");
        }
    }
    if tokio::time::timeout(config.shutdown_timeout(), input_handle)
        .await
        .is_err()
    {
        debug!("input reader still blocked at exit");
    }

    info!("shutdown complete");
    result
}

/// Forward SIGINT/SIGTERM as a quit command.
///
/// Raw mode turns Ctrl-C into a key event, so this mostly covers external
/// `kill` and service-manager stops.
fn spawn_signal_listener(tx: mpsc::Sender<Command>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!("cannot listen for SIGTERM: {err}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = sigterm.recv() => info!("termination signal received"),
        }
        let _ = tx.send(Command::Quit).await;
    })
}
