//! Console sink
//!
//! The actual UART/VGA device lives outside this crate; the boot shim
//! registers whatever it has. Until then output is dropped and input reads
//! as "nothing waiting", which is all the memory core needs.

use spin::Mutex;

use crate::sync;

/// Byte-oriented console device.
pub trait Console: Send {
    fn putc(&mut self, byte: u8);
    /// Non-blocking read; `None` when no input is waiting.
    fn getc(&mut self) -> Option<u8>;
}

static CONSOLE: Mutex<Option<&'static mut dyn Console>> = Mutex::new(None);

/// Install the system console. Called once by the boot shim.
pub fn register(dev: &'static mut dyn Console) {
    *CONSOLE.lock() = Some(dev);
}

/// Write a byte slice to the console, if one is registered.
pub fn put_bytes(bytes: &[u8]) {
    let _section = sync::console_lock().lock();
    if let Some(dev) = CONSOLE.lock().as_mut() {
        for &b in bytes {
            dev.putc(b);
        }
    }
}

/// Read one character without blocking; 0 means no input waiting.
pub fn getc() -> u8 {
    let _section = sync::console_lock().lock();
    CONSOLE
        .lock()
        .as_mut()
        .and_then(|dev| dev.getc())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_console_reads_nothing() {
        assert_eq!(getc(), 0);
        put_bytes(b"dropped");
    }
}
