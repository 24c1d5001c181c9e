//! `shutterd` - Headless camera control daemon
//!
//! This library provides the core functionality for driving an attached
//! camera from raw terminal keystrokes: photo and video capture through
//! supervised external tool processes, live preview, disk space
//! supervision with retention cleanup, and a retrying background upload
//! worker for completed media.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod disk;
pub mod error;
pub mod input;
pub mod logging;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod upload;

pub use config::Config;
pub use controller::{Controller, DaemonState};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use session::{CaptureKind, CaptureSession, SessionStatus};
pub use status::StatusSnapshot;
