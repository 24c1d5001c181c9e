//! Capture session types for shutterd.
//!
//! This module defines the data structures representing one photo or video
//! operation from admission to process completion, plus the timestamp-based
//! output naming rules shared by the controller and the disk monitor.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Timestamp format embedded in output filenames, local time at second
/// resolution.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// The kind of capture a session performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// A single still photo.
    Photo,
    /// A video recording of operator-controlled duration.
    Video,
}

impl CaptureKind {
    /// File extension for media of this kind.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Photo => "jpg",
            Self::Video => "h264",
        }
    }
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Photo => write!(f, "photo"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Lifecycle state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Admitted but not yet spawned.
    Pending,
    /// Capture process is running.
    Running,
    /// Process exited successfully and the output file exists.
    Completed,
    /// Process failed or produced no output.
    Failed,
}

impl SessionStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One capture operation from admission to process completion.
///
/// At most one non-terminal session exists at any instant; the controller's
/// single-writer command loop enforces this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSession {
    /// What this session captures.
    pub kind: CaptureKind,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// When the session was admitted.
    pub started_at: DateTime<Local>,
    /// Where the capture tool writes its output.
    pub output_path: PathBuf,
}

impl CaptureSession {
    /// Create a new pending session.
    #[must_use]
    pub fn new(kind: CaptureKind, output_path: PathBuf) -> Self {
        Self {
            kind,
            status: SessionStatus::Pending,
            started_at: Local::now(),
            output_path,
        }
    }

    /// One-line summary for status output.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} {:?} {}",
            self.kind,
            self.status,
            self.output_path.display()
        )
    }
}

/// Generate the filename stem for a capture admitted at `now`.
#[must_use]
pub fn timestamp_stem(now: DateTime<Local>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Resolve a collision-free output path under `dir`.
///
/// Two captures admitted within the same second would collide at second
/// resolution; a numeric suffix (`_1`, `_2`, ...) is appended rather than
/// silently overwriting the earlier file.
#[must_use]
pub fn unique_output_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }
    for n in 1.. {
        let candidate = dir.join(format!("{stem}_{n}.{extension}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("suffix search is unbounded")
}

/// Parse the timestamp embedded in a media filename.
///
/// Accepts both plain stems (`20240501_120000.jpg`) and collision-suffixed
/// ones (`20240501_120000_2.jpg`). Returns `None` for names that don't
/// follow the capture naming scheme, so foreign files are never considered
/// for cleanup.
#[must_use]
pub fn parse_timestamp_stem(file_name: &str) -> Option<NaiveDateTime> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    // Strip a trailing collision suffix if present.
    let base = match stem.char_indices().rev().find(|(_, c)| *c == '_') {
        Some((idx, _)) if idx > 8 && stem[idx + 1..].chars().all(|c| c.is_ascii_digit()) => {
            &stem[..idx]
        }
        _ => stem,
    };
    NaiveDateTime::parse_from_str(base, TIMESTAMP_FORMAT).ok()
}
