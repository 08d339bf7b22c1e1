//! Minimal stderr logger behind the `log` facade.
//!
//! All bus components log through `log::{debug,info,warn,error}`; this module
//! provides the default sink. Hosts embedding the crate can install their own
//! `log` backend instead; `init()` silently yields if a logger is already
//! set.

use crate::config::{Config, LogLevel};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "\x1b[31m[ERROR]\x1b[0m",
            Level::Warn => "\x1b[33m[WARN]\x1b[0m",
            Level::Info => "\x1b[34m[INFO]\x1b[0m",
            Level::Debug | Level::Trace => "\x1b[90m[DEBUG]\x1b[0m",
        };
        let line = format!(
            "{} {} \x1b[33m[{}]\x1b[0m {}\n",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            tag,
            record.target(),
            record.args()
        );
        let _ = std::io::stderr().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Error => LevelFilter::Error,
        LogLevel::None => LevelFilter::Off,
    }
}

static LOGGER: StderrLogger = StderrLogger;

/// Install the default stderr logger at the configured level.
///
/// Idempotent; a pre-existing logger (test harness, host application) wins.
pub fn init() {
    let filter = level_filter(Config::global().log_level.0);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping() {
        assert_eq!(level_filter(LogLevel::Debug), LevelFilter::Debug);
        assert_eq!(level_filter(LogLevel::None), LevelFilter::Off);
        assert_eq!(level_filter(LogLevel::Error), LevelFilter::Error);
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
