//! Kernel logger
//!
//! Bridges the `log` facade onto the console sink. Records are formatted
//! into a fixed stack buffer; anything longer is truncated rather than
//! allocated for, since the logger runs on fault paths.

use core::fmt::{self, Write};

use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};

use crate::console;

const LINE_CAP: usize = 256;

struct LineBuf {
    buf: [u8; LINE_CAP],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            buf: [0; LINE_CAP],
            len: 0,
        }
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAP - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Logger instance handed to `log::set_logger`.
pub struct KernelLog {
    max_level: LevelFilter,
}

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = LineBuf::new();
        let _ = write!(
            line,
            "[{:5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
        console::put_bytes(&line.buf[..line.len]);
    }

    fn flush(&self) {}
}

lazy_static! {
    static ref KLOG: KernelLog = KernelLog {
        max_level: LevelFilter::Info,
    };
}

/// Route the `log` macros through the kernel console. Called once at boot;
/// a second call (e.g. from tests racing each other) is harmless.
pub fn init() {
    let _ = log::set_logger(&*KLOG);
    log::set_max_level(LevelFilter::Info);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_truncates_instead_of_overflowing() {
        let mut line = LineBuf::new();
        for _ in 0..LINE_CAP {
            line.write_str("xy").expect("buffer writes never fail");
        }
        assert_eq!(line.len, LINE_CAP);
    }

    #[test]
    fn init_twice_is_harmless() {
        init();
        init();
        log::info!("logger smoke test");
    }
}
