//! Raw-terminal key input.
//!
//! The daemon reads single unbuffered keystrokes from the controlling
//! terminal and maps them to controller commands. Raw mode is held by a
//! guard that restores the terminal on drop and from a panic hook, so a
//! crash never leaves the shell unusable. While a spawned interactive shell
//! owns the terminal the reader is suspended and raw mode is released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A keystroke mapped to a daemon action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Capture a single photo.
    Photo,
    /// Start or stop video recording.
    ToggleVideo,
    /// Start or stop the live preview.
    TogglePreview,
    /// Suspend into an interactive shell.
    Shell,
    /// Print a status report.
    Status,
    /// Shut the daemon down.
    Quit,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Photo => write!(f, "photo"),
            Self::ToggleVideo => write!(f, "toggle-video"),
            Self::TogglePreview => write!(f, "toggle-preview"),
            Self::Shell => write!(f, "shell"),
            Self::Status => write!(f, "status"),
            Self::Quit => write!(f, "quit"),
        }
    }
}

/// Map a terminal key event to a command.
///
/// Only key presses map; repeats and releases are ignored. Ctrl-C maps to
/// quit since raw mode swallows the usual signal.
#[must_use]
pub fn map_key(key: &KeyEvent) -> Option<Command> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('c') => Some(Command::Quit),
            _ => None,
        };
    }
    match key.code {
        KeyCode::Char(' ') => Some(Command::Photo),
        KeyCode::Char('v') | KeyCode::Char('V') => Some(Command::ToggleVideo),
        KeyCode::Char('p') | KeyCode::Char('P') => Some(Command::TogglePreview),
        KeyCode::Char('s') | KeyCode::Char('S') => Some(Command::Status),
        KeyCode::Char('h') | KeyCode::Char('H') => Some(Command::Shell),
        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => Some(Command::Quit),
        _ => None,
    }
}

/// RAII guard for terminal raw mode.
///
/// Restores cooked mode on drop. [`RawModeGuard::install_panic_hook`]
/// additionally restores the terminal before the default panic output so
/// the backtrace is readable.
#[derive(Debug)]
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    /// Enter raw mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal rejects the mode change, e.g. when
    /// stdin is not a tty.
    pub fn new() -> std::io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self { active: true })
    }

    /// Temporarily leave raw mode, for handing the terminal to a shell.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal rejects the mode change.
    pub fn suspend(&mut self) -> std::io::Result<()> {
        if self.active {
            terminal::disable_raw_mode()?;
            self.active = false;
        }
        Ok(())
    }

    /// Re-enter raw mode after [`RawModeGuard::suspend`].
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal rejects the mode change.
    pub fn resume(&mut self) -> std::io::Result<()> {
        if !self.active {
            terminal::enable_raw_mode()?;
            self.active = true;
        }
        Ok(())
    }

    /// Chain a panic hook that restores the terminal before unwinding.
    pub fn install_panic_hook() {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = terminal::disable_raw_mode();
            previous(info);
        }));
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = terminal::disable_raw_mode();
        }
    }
}

/// Key reader running on a blocking thread.
///
/// Polls the terminal with a short timeout so the suspend flag is observed
/// promptly, maps presses to commands, and forwards them over a bounded
/// channel. When the channel is full the keystroke is dropped and counted
/// rather than queued, so a burst of presses cannot build a backlog of
/// stale captures.
#[derive(Debug)]
pub struct InputReader {
    tx: mpsc::Sender<Command>,
    suspended: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl InputReader {
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Create a reader feeding `tx`.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Command>, suspended: Arc<AtomicBool>) -> Self {
        Self {
            tx,
            suspended,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of keystrokes dropped because the channel was full.
    #[must_use]
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    /// Read keys until the command channel closes.
    ///
    /// Blocking; run via `tokio::task::spawn_blocking`.
    pub fn run(self) {
        loop {
            if self.tx.is_closed() {
                break;
            }
            if self.suspended.load(Ordering::Acquire) {
                std::thread::sleep(Self::POLL_INTERVAL);
                continue;
            }
            match event::poll(Self::POLL_INTERVAL) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(err) => {
                    warn!("terminal poll failed: {err}");
                    break;
                }
            }
            let ev = match event::read() {
                Ok(ev) => ev,
                Err(err) => {
                    warn!("terminal read failed: {err}");
                    break;
                }
            };
            let Event::Key(key) = ev else { continue };
            let Some(command) = map_key(&key) else {
                continue;
            };
            match self.tx.try_send(command) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(cmd)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!("dropped {cmd} keystroke, {total} dropped so far");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        debug!("input reader stopped");
    }
}
