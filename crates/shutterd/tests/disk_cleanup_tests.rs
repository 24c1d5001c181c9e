//! Integration tests for disk monitoring and cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use shutterd::disk::{DiskMonitor, DiskProbe, DiskState, Watermark};
use shutterd::error::Result;
use shutterd::upload::ProtectedPaths;

/// Probe that reports fixed numbers instead of querying a filesystem.
#[derive(Debug)]
struct FixedProbe {
    free: u64,
    total: u64,
}

impl DiskProbe for FixedProbe {
    fn sample(&self, _path: &Path) -> Result<(u64, u64)> {
        Ok((self.free, self.total))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    photos: PathBuf,
    videos: PathBuf,
    protected: ProtectedPaths,
    state_rx: watch::Receiver<DiskState>,
    monitor: DiskMonitor,
}

const MB: u64 = 1024 * 1024;

fn fixture(free: u64, max_photos: usize, max_videos: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let photos = dir.path().join("photos");
    let videos = dir.path().join("videos");
    std::fs::create_dir_all(&photos).unwrap();
    std::fs::create_dir_all(&videos).unwrap();

    let (state_tx, state_rx) = watch::channel(DiskState::default());
    let protected = ProtectedPaths::new();
    let monitor = DiskMonitor::new(
        photos.clone(),
        videos.clone(),
        500 * MB,
        100 * MB,
        Duration::from_secs(30),
        max_photos,
        max_videos,
        Arc::new(FixedProbe {
            free,
            total: 1024 * MB,
        }),
        state_tx,
        Arc::new(Mutex::new(())),
        protected.clone(),
    );

    Fixture {
        _dir: dir,
        photos,
        videos,
        protected,
        state_rx,
        monitor,
    }
}

fn write_media(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, vec![0_u8; size]).unwrap();
    path
}

#[tokio::test]
async fn disk_cleanup_tests_sample_classifies_watermark() {
    let fx = fixture(50 * MB, 0, 0);
    let state = fx.monitor.sample().unwrap();
    assert_eq!(state.watermark, Watermark::Critical);
    assert!(state.is_critical());

    let fx = fixture(300 * MB, 0, 0);
    assert_eq!(fx.monitor.sample().unwrap().watermark, Watermark::Low);

    let fx = fixture(800 * MB, 0, 0);
    assert_eq!(fx.monitor.sample().unwrap().watermark, Watermark::Normal);
    // The initial published state is untouched until the monitor ticks.
    assert_eq!(*fx.state_rx.borrow(), DiskState::default());
}

#[tokio::test]
async fn disk_cleanup_tests_removes_oldest_first() {
    let fx = fixture(50 * MB, 0, 0);
    let oldest = write_media(&fx.photos, "20240501_100000.jpg", 1024);
    let middle = write_media(&fx.photos, "20240501_110000.jpg", 1024);
    let newest = write_media(&fx.photos, "20240501_120000.jpg", 1024);

    // 50 MB free, low water at 500 MB: needs far more than the files can
    // provide, so everything unprotected goes oldest first.
    let report = fx.monitor.cleanup(50 * MB).await.unwrap();

    assert_eq!(report.removed, 3);
    assert!(!oldest.exists());
    assert!(!middle.exists());
    assert!(!newest.exists());
}

#[tokio::test]
async fn disk_cleanup_tests_stops_once_enough_is_freed() {
    let fx = fixture(480 * MB, 0, 0);
    let oldest = write_media(&fx.photos, "20240501_100000.jpg", 32 * 1024);
    let newest = write_media(&fx.photos, "20240501_110000.jpg", 32 * 1024);

    // Just below the low watermark: 16 KB short, the oldest 32 KB file
    // covers it on its own.
    let report = fx.monitor.cleanup(500 * MB - 16 * 1024).await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(!oldest.exists());
    assert!(newest.exists());
}

#[tokio::test]
async fn disk_cleanup_tests_never_deletes_protected_files() {
    let fx = fixture(50 * MB, 0, 0);
    let pending_upload = write_media(&fx.photos, "20240501_100000.jpg", 1024);
    let expendable = write_media(&fx.photos, "20240501_110000.jpg", 1024);
    fx.protected.insert(pending_upload.clone());

    let report = fx.monitor.cleanup(50 * MB).await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(pending_upload.exists(), "protected file must survive");
    assert!(!expendable.exists());
}

#[tokio::test]
async fn disk_cleanup_tests_enforces_retention_caps() {
    let fx = fixture(800 * MB, 2, 1);
    write_media(&fx.photos, "20240501_100000.jpg", 1024);
    write_media(&fx.photos, "20240501_110000.jpg", 1024);
    let kept_photo = write_media(&fx.photos, "20240501_120000.jpg", 1024);
    write_media(&fx.videos, "20240501_100500.h264", 1024);
    let kept_video = write_media(&fx.videos, "20240501_110500.h264", 1024);

    // Plenty of free space; only the caps apply.
    let report = fx.monitor.cleanup(800 * MB).await.unwrap();

    assert_eq!(report.removed, 2);
    assert!(kept_photo.exists());
    assert!(kept_video.exists());
    assert_eq!(std::fs::read_dir(&fx.photos).unwrap().count(), 2);
    assert_eq!(std::fs::read_dir(&fx.videos).unwrap().count(), 1);
}

#[tokio::test]
async fn disk_cleanup_tests_ignores_foreign_files() {
    let fx = fixture(50 * MB, 0, 0);
    let foreign = write_media(&fx.photos, "holiday-snap.jpg", 1024);
    let ours = write_media(&fx.photos, "20240501_100000.jpg", 1024);

    let report = fx.monitor.cleanup(50 * MB).await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(foreign.exists(), "foreign file is not a cleanup candidate");
    assert!(!ours.exists());
}
