//! Status reporting.
//!
//! One snapshot type serves both the in-daemon `s` key report and the
//! `shutterd status` subcommand. The gather path only touches disk state,
//! the media directories, and the upload journal, so a snapshot can be
//! produced whether or not a daemon is running; the live controller fills
//! in the fields only it knows.

use chrono::Utc;
use serde::Serialize;

use crate::config::Config;
use crate::disk::{scan_media, DiskProbe, DiskState, StatvfsProbe};
use crate::error::Result;
use crate::session::CaptureSession;
use crate::upload::{QueueJournal, UploadStats};

/// Point-in-time view of the daemon and its storage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    /// Whether a video recording is in progress.
    pub recording: bool,
    /// Whether the live preview is running.
    pub preview_active: bool,
    /// Free-space state of the output volume.
    pub disk: DiskState,
    /// Upload queue counters.
    pub upload: UploadStats,
    /// The most recently finished capture session. Absent for offline
    /// snapshots and before the first capture.
    pub last_session: Option<CaptureSession>,
    /// Photos currently on disk.
    pub photos_on_disk: usize,
    /// Videos currently on disk.
    pub videos_on_disk: usize,
    /// Photos captured since startup. Zero for offline snapshots.
    pub photos_taken: u64,
    /// Videos recorded since startup. Zero for offline snapshots.
    pub videos_recorded: u64,
    /// Keystrokes dropped because the command channel was full.
    pub dropped_keys: u64,
}

impl StatusSnapshot {
    /// Gather the parts of a snapshot that don't require a running daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the output volume cannot be sampled or the media
    /// directories cannot be scanned.
    pub fn gather(config: &Config) -> Result<Self> {
        let photos_dir = config.photos_dir();
        let videos_dir = config.videos_dir();

        let (free, total) = StatvfsProbe.sample(&config.output_dir())?;
        let disk = DiskState::classify(
            free,
            total,
            config.low_water_bytes(),
            config.critical_water_bytes(),
        );

        let media = scan_media(&photos_dir, &videos_dir)?;
        let photos_on_disk = media.iter().filter(|f| f.is_photo).count();
        let videos_on_disk = media.len() - photos_on_disk;

        let upload = match QueueJournal::new(config.journal_path()).load() {
            Ok(tasks) => UploadStats::from_tasks(&tasks),
            Err(_) => UploadStats::default(),
        };

        Ok(Self {
            disk,
            upload,
            photos_on_disk,
            videos_on_disk,
            ..Self::default()
        })
    }

    /// Render the snapshot for a raw-mode terminal.
    ///
    /// Uses explicit `\r\n` line endings so the report stays aligned while
    /// raw mode disables output post-processing.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("-- status --\r\n");
        out.push_str(&format!(
            "recording: {}  preview: {}\r\n",
            if self.recording { "yes" } else { "no" },
            if self.preview_active { "yes" } else { "no" },
        ));
        out.push_str(&format!(
            "disk: {} ({} MB free, {:.1}%)\r\n",
            self.disk.watermark,
            self.disk.free_bytes / (1024 * 1024),
            self.disk.free_percent(),
        ));
        out.push_str(&format!(
            "media: {} photos, {} videos on disk\r\n",
            self.photos_on_disk, self.videos_on_disk,
        ));
        out.push_str(&format!(
            "session: {} photos taken, {} videos recorded\r\n",
            self.photos_taken, self.videos_recorded,
        ));
        if let Some(session) = &self.last_session {
            out.push_str(&format!("last capture: {}\r\n", session.summary()));
        }
        out.push_str(&format!(
            "uploads: {} queued{}, {} succeeded, {} failed{}\r\n",
            self.upload.queued,
            if self.upload.uploading {
                " (1 in flight)"
            } else {
                ""
            },
            self.upload.succeeded,
            self.upload.failed,
            if self.upload.paused {
                " (paused for auth)"
            } else {
                ""
            },
        ));
        if let Some(enqueued) = self.upload.oldest_pending {
            let age = Utc::now().signed_duration_since(enqueued);
            out.push_str(&format!("oldest pending upload: {}\r\n", format_age(age)));
        }
        if self.dropped_keys > 0 {
            out.push_str(&format!("dropped keystrokes: {}\r\n", self.dropped_keys));
        }
        out
    }
}

/// Render a task age as a compact duration, e.g. `45s`, `5m12s`, `2h03m`.
fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Watermark;

    #[test]
    fn test_render_uses_crlf() {
        let snapshot = StatusSnapshot::default();
        let rendered = snapshot.render();
        assert!(rendered.starts_with("-- status --\r\n"));
        for line in rendered.split("\r\n") {
            assert!(!line.contains('\n'));
        }
    }

    #[test]
    fn test_render_reflects_fields() {
        let snapshot = StatusSnapshot {
            recording: true,
            preview_active: false,
            disk: DiskState::classify(50 * 1024 * 1024, 1024 * 1024 * 1024, 500, 100),
            photos_on_disk: 3,
            videos_on_disk: 1,
            photos_taken: 2,
            videos_recorded: 1,
            ..StatusSnapshot::default()
        };
        let rendered = snapshot.render();
        assert!(rendered.contains("recording: yes"));
        assert!(rendered.contains("preview: no"));
        assert!(rendered.contains("3 photos, 1 videos"));
        assert!(rendered.contains("2 photos taken"));
    }

    #[test]
    fn test_render_hides_dropped_when_zero() {
        let snapshot = StatusSnapshot::default();
        assert!(!snapshot.render().contains("dropped"));

        let snapshot = StatusSnapshot {
            dropped_keys: 4,
            ..StatusSnapshot::default()
        };
        assert!(snapshot.render().contains("dropped keystrokes: 4"));
    }

    #[test]
    fn test_render_paused_marker() {
        let snapshot = StatusSnapshot {
            upload: UploadStats {
                queued: 1,
                paused: true,
                ..UploadStats::default()
            },
            ..StatusSnapshot::default()
        };
        assert!(snapshot.render().contains("(paused for auth)"));
    }

    #[test]
    fn test_default_watermark_is_normal() {
        let snapshot = StatusSnapshot::default();
        assert_eq!(snapshot.disk.watermark, Watermark::Normal);
    }

    #[test]
    fn test_render_oldest_pending_age() {
        let snapshot = StatusSnapshot {
            upload: UploadStats {
                queued: 2,
                oldest_pending: Some(Utc::now() - chrono::Duration::minutes(5)),
                ..UploadStats::default()
            },
            ..StatusSnapshot::default()
        };
        let rendered = snapshot.render();
        assert!(rendered.contains("oldest pending upload: 5m"));
    }

    #[test]
    fn test_render_hides_oldest_pending_when_queue_empty() {
        let snapshot = StatusSnapshot::default();
        assert!(!snapshot.render().contains("oldest pending"));
    }

    #[test]
    fn test_render_last_session() {
        use crate::session::{CaptureKind, SessionStatus};

        let mut session = CaptureSession::new(
            CaptureKind::Video,
            std::path::PathBuf::from("/tmp/20260826_101500.h264"),
        );
        session.status = SessionStatus::Completed;
        let snapshot = StatusSnapshot {
            last_session: Some(session),
            ..StatusSnapshot::default()
        };
        let rendered = snapshot.render();
        assert!(rendered.contains("last capture:"));
        assert!(rendered.contains("20260826_101500.h264"));
    }

    #[test]
    fn test_format_age_buckets() {
        assert_eq!(format_age(chrono::Duration::seconds(45)), "45s");
        assert_eq!(format_age(chrono::Duration::seconds(312)), "5m12s");
        assert_eq!(format_age(chrono::Duration::seconds(7380)), "2h03m");
        assert_eq!(format_age(chrono::Duration::seconds(-3)), "0s");
    }
}
