//! Session logger for the editor core.
//!
//! Lines go to a per-session file in the OS data directory, truncated at
//! every launch:
//!   Windows:  `%APPDATA%\MaskFE\maskfe.log`
//!   Linux:    `~/.local/share/MaskFE/maskfe.log`
//!   macOS:    `~/Library/Application Support/MaskFE/maskfe.log`
//!
//! Warnings and errors are also kept in a small in-memory ring so a host can
//! surface them as non-blocking notices ([`recent_notices`]).
//!
//! Use the `log_info!` / `log_warn!` / `log_err!` macros.  Before [`init`]
//! only the notice ring is fed, so library users and tests log for free.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

const NOTICE_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        })
    }
}

struct Sink {
    file: Option<File>,
    path: Option<PathBuf>,
    /// Lines at or above this level are mirrored to stderr.
    echo_from: Option<Level>,
    started: Instant,
}

static SINK: OnceLock<Mutex<Sink>> = OnceLock::new();
static NOTICES: Mutex<VecDeque<String>> = Mutex::new(VecDeque::new());

/// Path of the current session log, once [`init`] has opened one.
pub fn log_path() -> Option<PathBuf> {
    let sink = SINK.get()?.lock().ok()?;
    sink.path.clone()
}

/// Most recent warnings and errors, oldest first.
pub fn recent_notices() -> Vec<String> {
    match NOTICES.lock() {
        Ok(q) => q.iter().cloned().collect(),
        Err(_) => Vec::new(),
    }
}

/// Record one message.  I/O errors are swallowed; logging never fails an edit.
pub fn write(level: Level, msg: &str) {
    if level >= Level::Warn
        && let Ok(mut q) = NOTICES.lock()
    {
        if q.len() == NOTICE_CAPACITY {
            q.pop_front();
        }
        q.push_back(format!("{}: {}", level, msg));
    }

    let Some(mutex) = SINK.get() else { return };
    let Ok(mut sink) = mutex.lock() else { return };
    let line = format!("[{:>9.3}] [{}] {}", sink.started.elapsed().as_secs_f64(), level, msg);
    if let Some(file) = sink.file.as_mut() {
        let _ = writeln!(file, "{}", line);
    }
    if sink.echo_from.is_some_and(|min| level >= min) {
        eprintln!("{}", line);
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Error, &format!($($arg)*))
    };
}

/// Open the session log.  Call once, early in `main`.
///
/// `verbose` mirrors every line to stderr; otherwise only errors are echoed.
/// A panic hook copies panic messages into the log before the default
/// handler runs.
pub fn init(verbose: bool) {
    let path = data_dir().join("MaskFE").join("maskfe.log");
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let file = match OpenOptions::new().create(true).write(true).truncate(true).open(&path) {
        Ok(f) => Some(f),
        Err(e) => {
            eprintln!("[logger] Failed to open log file {:?}: {}", path, e);
            None
        }
    };
    let sink = Sink {
        path: file.as_ref().map(|_| path.clone()),
        file,
        echo_from: Some(if verbose { Level::Info } else { Level::Error }),
        started: Instant::now(),
    };
    if SINK.set(Mutex::new(sink)).is_err() {
        return;
    }

    log_info!("=== MaskFE {} session started ===", env!("CARGO_PKG_VERSION"));

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log_err!("PANIC: {}", info);
        prev(info);
    }));
}

/// Platform data directory (without the app sub-folder).
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}
