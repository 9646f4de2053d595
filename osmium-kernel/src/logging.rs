//! Kernel logging
//!
//! Backend for the `log` crate facade: records are formatted into a stack
//! buffer (no allocation, no locks taken while formatting) and written to
//! the PAL console with a tick-derived timestamp. The panic path bypasses
//! this entirely and writes to the console directly.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use osmium_pal::{console, timer};

/// Formatting scratch; long messages are truncated, not split.
const MSG_MAX: usize = 256;

struct MessageBuffer {
    data: [u8; MSG_MAX],
    len: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            data: [0; MSG_MAX],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("<invalid>")
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let to_copy = bytes.len().min(MSG_MAX - self.len);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let time_ms = timer::now_ms();
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        let mut buf = MessageBuffer::new();
        let _ = writeln!(
            buf,
            "[{:>5}.{:03}] {} {}: {}",
            time_ms / 1000,
            time_ms % 1000,
            level,
            record.target(),
            record.args()
        );
        console::puts(buf.as_str());
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the console logger. Called once, early in boot.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .ok();
}
