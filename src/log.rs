//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details
//!
//! The runtime reports its lifecycle through the [`log`] facade: fiber
//! spawns, context switches, reactor wakeups and so on. If the hosting
//! program never installs a logger, all of it is swallowed by the facade at
//! near-zero cost. [`StderrLogger`] is the built-in sink: one line per
//! event, prefixed with a level tag.
//!
//! Example:
//! ```no_run
//! use log::{info, LevelFilter};
//!
//! strand::log::init_with_level(LevelFilter::Debug).unwrap();
//! info!("Hello {}", "world");
//! ```

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::OnceCell;

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait implementation
/// writing one `[level] message` line per event to stderr.
pub struct StderrLogger(fn(Level) -> &'static str);

impl StderrLogger {
    #[inline(always)]
    pub const fn new() -> Self {
        StderrLogger(level_tag)
    }

    /// Override how a [`log::Level`] is rendered into the line prefix.
    #[inline(always)]
    pub const fn with_mapping(map_fn: fn(Level) -> &'static str) -> Self {
        StderrLogger(map_fn)
    }
}

impl Default for StderrLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for StderrLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // A single write_all keeps concurrent lines from interleaving.
        let line = format!("[{}] {}\n", (self.0)(record.level()), record.args());
        let _ = std::io::stderr().write_all(line.as_bytes());
    }

    #[inline(always)]
    fn flush(&self) {}
}

/// Five-column level tags, so the message column lines up.
#[inline]
fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warn_",
        Level::Info => "info_",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}

static LOGGER: OnceCell<StderrLogger> = OnceCell::new();

/// Install [`StderrLogger`] as the process-wide logger with the `Warn`
/// filter. Fails if another logger has been installed already.
#[inline(always)]
pub fn init() -> Result<(), SetLoggerError> {
    init_with_level(LevelFilter::Warn)
}

/// Install [`StderrLogger`] as the process-wide logger with the given level
/// filter.
pub fn init_with_level(level: LevelFilter) -> Result<(), SetLoggerError> {
    let logger = LOGGER.get_or_init(StderrLogger::new);
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}
