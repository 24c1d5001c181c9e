//! Disk space monitoring and retention cleanup.
//!
//! A fixed-interval task samples free space on the output volume, maps it to
//! a watermark, and publishes the result over a watch channel the capture
//! controller consults before admitting new captures. In the critical band
//! the monitor reclaims space by deleting the oldest completed media files,
//! ordered by the timestamp embedded in their names, while never touching a
//! file still referenced by a non-terminal upload task.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::session::parse_timestamp_stem;
use crate::upload::ProtectedPaths;

/// Free-space band on the output volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Watermark {
    /// Plenty of space.
    #[default]
    Normal,
    /// Below the low watermark: warn only.
    Low,
    /// Below the critical watermark: veto new captures and clean up.
    Critical,
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Snapshot of the output volume, recomputed each monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DiskState {
    /// Bytes free on the volume.
    pub free_bytes: u64,
    /// Total bytes on the volume.
    pub total_bytes: u64,
    /// Band the free space falls in.
    pub watermark: Watermark,
}

impl DiskState {
    /// Build a state from a probe sample and the configured watermarks.
    #[must_use]
    pub fn classify(free_bytes: u64, total_bytes: u64, low_water: u64, critical_water: u64) -> Self {
        let watermark = if free_bytes < critical_water {
            Watermark::Critical
        } else if free_bytes < low_water {
            Watermark::Low
        } else {
            Watermark::Normal
        };
        Self {
            free_bytes,
            total_bytes,
            watermark,
        }
    }

    /// Free space as a percentage of the volume.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn free_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.free_bytes as f64 / self.total_bytes as f64) * 100.0
    }

    /// Whether new captures must be vetoed.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.watermark == Watermark::Critical
    }
}

/// Source of free-space samples.
///
/// A trait seam so tests can script disk pressure without filling a volume.
pub trait DiskProbe: Send + Sync + std::fmt::Debug {
    /// Sample `(free_bytes, total_bytes)` for the volume holding `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be queried.
    fn sample(&self, path: &Path) -> Result<(u64, u64)>;
}

/// Probe backed by `statvfs`.
#[derive(Debug, Default)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    fn sample(&self, path: &Path) -> Result<(u64, u64)> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
        let fragment = stat.fragment_size();
        let free = stat.blocks_available() * fragment;
        let total = stat.blocks() * fragment;
        Ok((free, total))
    }
}

/// A media file eligible for cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    /// Location on disk.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Timestamp parsed from the filename.
    pub captured_at: chrono::NaiveDateTime,
    /// Whether the file lives in the photos directory.
    pub is_photo: bool,
}

/// Scan the output directories for capture-named media, oldest first.
///
/// Files that don't follow the capture naming scheme are ignored so foreign
/// files are never cleanup candidates.
///
/// # Errors
///
/// Returns an error if a directory cannot be read. Missing directories are
/// treated as empty.
pub fn scan_media(photos_dir: &Path, videos_dir: &Path) -> Result<Vec<MediaFile>> {
    let mut files = Vec::new();
    for (dir, is_photo) in [(photos_dir, true), (videos_dir, false)] {
        if !dir.exists() {
            continue;
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(captured_at) = parse_timestamp_stem(name) else {
                continue;
            };
            let size = entry.metadata()?.len();
            files.push(MediaFile {
                path,
                size,
                captured_at,
                is_photo,
            });
        }
    }
    files.sort_by(|a, b| a.captured_at.cmp(&b.captured_at));
    Ok(files)
}

/// Select files to remove: retention-cap overflow plus the oldest files
/// until the estimated freed bytes reach `bytes_needed`.
///
/// Never selects a protected file. Caps of 0 mean unlimited.
#[must_use]
pub fn plan_removals(
    files: &[MediaFile],
    bytes_needed: u64,
    protected: &ProtectedPaths,
    max_photos: usize,
    max_videos: usize,
) -> Vec<MediaFile> {
    let photo_count = files.iter().filter(|f| f.is_photo).count();
    let video_count = files.len() - photo_count;

    let mut photo_overflow = if max_photos > 0 {
        photo_count.saturating_sub(max_photos)
    } else {
        0
    };
    let mut video_overflow = if max_videos > 0 {
        video_count.saturating_sub(max_videos)
    } else {
        0
    };

    let mut plan = Vec::new();
    let mut freed: u64 = 0;
    for file in files {
        if protected.contains(&file.path) {
            continue;
        }
        let over_cap = if file.is_photo {
            photo_overflow > 0
        } else {
            video_overflow > 0
        };
        if over_cap || freed < bytes_needed {
            if file.is_photo {
                photo_overflow = photo_overflow.saturating_sub(1);
            } else {
                video_overflow = video_overflow.saturating_sub(1);
            }
            freed += file.size;
            plan.push(file.clone());
        }
    }
    plan
}

/// Result of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Files removed.
    pub removed: usize,
    /// Bytes reclaimed.
    pub freed_bytes: u64,
}

/// The disk monitor task.
#[derive(Debug)]
pub struct DiskMonitor {
    photos_dir: PathBuf,
    videos_dir: PathBuf,
    low_water: u64,
    critical_water: u64,
    interval: Duration,
    max_photos: usize,
    max_videos: usize,
    probe: std::sync::Arc<dyn DiskProbe>,
    state_tx: watch::Sender<DiskState>,
    admission: std::sync::Arc<Mutex<()>>,
    protected: ProtectedPaths,
}

impl DiskMonitor {
    /// Create a monitor.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        photos_dir: PathBuf,
        videos_dir: PathBuf,
        low_water: u64,
        critical_water: u64,
        interval: Duration,
        max_photos: usize,
        max_videos: usize,
        probe: std::sync::Arc<dyn DiskProbe>,
        state_tx: watch::Sender<DiskState>,
        admission: std::sync::Arc<Mutex<()>>,
        protected: ProtectedPaths,
    ) -> Self {
        Self {
            photos_dir,
            videos_dir,
            low_water,
            critical_water,
            interval,
            max_photos,
            max_videos,
            probe,
            state_tx,
            admission,
            protected,
        }
    }

    /// Sample the current disk state.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be queried.
    pub fn sample(&self) -> Result<DiskState> {
        let (free, total) = self.probe.sample(&self.photos_dir)?;
        Ok(DiskState::classify(
            free,
            total,
            self.low_water,
            self.critical_water,
        ))
    }

    /// Run the monitor until the state receiver side is gone.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let state = match self.sample() {
                Ok(state) => state,
                Err(err) => {
                    warn!("disk sample failed: {err}");
                    continue;
                }
            };
            match state.watermark {
                Watermark::Normal => {}
                Watermark::Low => {
                    warn!(
                        "disk space low: {:.1}% free ({} MB)",
                        state.free_percent(),
                        state.free_bytes / (1024 * 1024)
                    );
                }
                Watermark::Critical => {
                    warn!(
                        "disk space critical: {} MB free, starting cleanup",
                        state.free_bytes / (1024 * 1024)
                    );
                    if self.state_tx.send(state).is_err() {
                        break;
                    }
                    match self.cleanup(state.free_bytes).await {
                        Ok(report) => info!(
                            "cleanup removed {} files, reclaimed {} MB",
                            report.removed,
                            report.freed_bytes / (1024 * 1024)
                        ),
                        Err(err) => warn!("cleanup failed: {err}"),
                    }
                }
            }
            // Publish the (possibly post-cleanup) state.
            let state = self.sample().unwrap_or(state);
            if self.state_tx.send(state).is_err() {
                break;
            }
        }
        debug!("disk monitor stopped");
    }

    /// One cleanup pass: delete oldest media until free space clears the
    /// low watermark, honoring retention caps and protected paths.
    ///
    /// Holds the admission lock for the whole pass so a capture cannot
    /// start mid-cleanup and cleanup cannot race a capture's file write.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be scanned.
    pub async fn cleanup(&self, free_bytes: u64) -> Result<CleanupReport> {
        let _guard = self.admission.lock().await;

        let files = scan_media(&self.photos_dir, &self.videos_dir)?;
        let bytes_needed = self.low_water.saturating_sub(free_bytes);
        let plan = plan_removals(
            &files,
            bytes_needed,
            &self.protected,
            self.max_photos,
            self.max_videos,
        );

        let mut report = CleanupReport::default();
        for file in plan {
            match std::fs::remove_file(&file.path) {
                Ok(()) => {
                    debug!("removed {}", file.path.display());
                    report.removed += 1;
                    report.freed_bytes += file.size;
                }
                Err(err) => warn!("failed to remove {}: {err}", file.path.display()),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(name: &str, size: u64, is_photo: bool) -> MediaFile {
        MediaFile {
            path: PathBuf::from(format!("/out/{name}")),
            size,
            captured_at: parse_timestamp_stem(name).unwrap(),
            is_photo,
        }
    }

    #[test]
    fn test_classify_normal() {
        let state = DiskState::classify(1000, 2000, 500, 100);
        assert_eq!(state.watermark, Watermark::Normal);
        assert!(!state.is_critical());
    }

    #[test]
    fn test_classify_low() {
        let state = DiskState::classify(400, 2000, 500, 100);
        assert_eq!(state.watermark, Watermark::Low);
        assert!(!state.is_critical());
    }

    #[test]
    fn test_classify_critical() {
        let state = DiskState::classify(50, 2000, 500, 100);
        assert_eq!(state.watermark, Watermark::Critical);
        assert!(state.is_critical());
    }

    #[test]
    fn test_free_percent() {
        let state = DiskState::classify(500, 2000, 100, 50);
        assert!((state.free_percent() - 25.0).abs() < f64::EPSILON);

        let empty = DiskState::default();
        assert!((empty.free_percent() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_watermark_display() {
        assert_eq!(Watermark::Normal.to_string(), "normal");
        assert_eq!(Watermark::Low.to_string(), "low");
        assert_eq!(Watermark::Critical.to_string(), "critical");
    }

    #[test]
    fn test_plan_removals_oldest_first() {
        let files = vec![
            media("20240501_100000.jpg", 100, true),
            media("20240501_110000.jpg", 100, true),
            media("20240501_120000.jpg", 100, true),
        ];
        let plan = plan_removals(&files, 150, &ProtectedPaths::new(), 0, 0);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].path, PathBuf::from("/out/20240501_100000.jpg"));
        assert_eq!(plan[1].path, PathBuf::from("/out/20240501_110000.jpg"));
    }

    #[test]
    fn test_plan_removals_never_deletes_protected() {
        let protected = ProtectedPaths::new();
        protected.insert(PathBuf::from("/out/20240501_100000.jpg"));

        let files = vec![
            media("20240501_100000.jpg", 100, true),
            media("20240501_110000.jpg", 100, true),
        ];
        // Needs more than both files can provide, but the protected one
        // must survive anyway.
        let plan = plan_removals(&files, 1000, &protected, 0, 0);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].path, PathBuf::from("/out/20240501_110000.jpg"));
    }

    #[test]
    fn test_plan_removals_retention_caps() {
        let files = vec![
            media("20240501_100000.jpg", 10, true),
            media("20240501_110000.jpg", 10, true),
            media("20240501_120000.jpg", 10, true),
            media("20240501_130000.h264", 10, false),
        ];
        // No byte pressure, but only 2 photos are retained.
        let plan = plan_removals(&files, 0, &ProtectedPaths::new(), 2, 5);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].path, PathBuf::from("/out/20240501_100000.jpg"));
    }

    #[test]
    fn test_plan_removals_nothing_needed() {
        let files = vec![media("20240501_100000.jpg", 10, true)];
        let plan = plan_removals(&files, 0, &ProtectedPaths::new(), 0, 0);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_scan_media_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let photos = dir.path().join("photos");
        let videos = dir.path().join("videos");
        std::fs::create_dir_all(&photos).unwrap();
        std::fs::create_dir_all(&videos).unwrap();

        std::fs::write(photos.join("20240501_100000.jpg"), b"abc").unwrap();
        std::fs::write(photos.join("notes.txt"), b"not media").unwrap();
        std::fs::write(videos.join("20240501_110000.h264"), b"abcdef").unwrap();

        let files = scan_media(&photos, &videos).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].is_photo);
        assert_eq!(files[0].size, 3);
        assert!(!files[1].is_photo);
    }

    #[test]
    fn test_scan_media_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let files = scan_media(&dir.path().join("nope"), &dir.path().join("also-nope")).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_statvfs_probe_samples_something() {
        let probe = StatvfsProbe;
        let (free, total) = probe.sample(Path::new("/")).unwrap();
        assert!(total > 0);
        assert!(free <= total);
    }
}
