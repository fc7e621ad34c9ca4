//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details.
//!
//! The runtime logs through the [`log`] facade with targets namespaced
//! `filament::<module>`. [`StderrLogger`] is a minimal backend for binaries
//! and tests; embedders are free to install any other [`log::Log`]
//! implementation instead.
//!
//! Example:
//! ```no_run
//! use log::{info, LevelFilter};
//!
//! filament::log::init_with_level(LevelFilter::Debug);
//! info!("Hello world");
//! ```

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

use crate::thread;

/// [`Log`] trait implementation writing one line per record to stderr:
/// timestamp, level, thread name, target, message.
pub struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = timestamp();
        let line = format!(
            "{} {:<5} [{}] {}: {}\n",
            now,
            record.level(),
            thread::current_name(),
            record.target(),
            record.args(),
        );
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = handle.write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// `YYYY-MM-DD hh:mm:ss.mmm` in local time, via `localtime_r`.
fn timestamp() -> String {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe { libc::localtime_r(&ts.tv_sec, &mut tm) };
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        ts.tv_nsec / 1_000_000,
    )
}

/// Install [`StderrLogger`] with the `Info` level.
///
/// Does nothing if a logger is already installed.
pub fn init() {
    init_with_level(LevelFilter::Info)
}

/// Install [`StderrLogger`] with the given level.
///
/// Does nothing if a logger is already installed, except for raising the max
/// level if needed.
pub fn init_with_level(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    if level > log::max_level() {
        log::set_max_level(level);
    }
}
