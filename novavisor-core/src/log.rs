//! Ring-buffer logging. No heap, no external `log` crate: the teacher's
//! own core has none either, and a 5-component static partitioning
//! hypervisor has no business depending on an allocator for this.
//!
//! Lines are pushed via the [`log`] macro (`format_args!` syntax) into a
//! fixed-size ring buffer that an external debugger can read out of a
//! known physical address; with the `uart` feature, bytes are also sent
//! out the legacy COM1 port for early boot debugging before any such
//! debugger is attached.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

const LOG_BUF_SIZE: usize = 64 * 1024;
static mut LOG_BUFFER: [u8; LOG_BUF_SIZE] = [0; LOG_BUF_SIZE];
static WRITE_POS: AtomicUsize = AtomicUsize::new(0);

#[cfg(feature = "uart")]
const UART_BASE: u16 = 0x3F8;

#[inline]
fn write_byte(b: u8) {
    let pos = WRITE_POS.fetch_add(1, Ordering::Relaxed) % LOG_BUF_SIZE;
    unsafe {
        (*core::ptr::addr_of_mut!(LOG_BUFFER))[pos] = b;
    }
    #[cfg(feature = "uart")]
    unsafe {
        novavisor_hal::pio::outb(UART_BASE, b);
    }
}

/// Writer implementing `core::fmt::Write` over the ring buffer; what the
/// [`log`] macro drives.
pub struct RingBufferWriter;

impl Write for RingBufferWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            write_byte(b);
        }
        Ok(())
    }
}

/// Formats and appends one line, CRLF-terminated.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = core::fmt::write(&mut $crate::log::RingBufferWriter, format_args!($($arg)*));
        let _ = $crate::log::RingBufferWriter.write_str("\r\n");
    }};
}

/// Read-only access to the ring buffer, for an external debugger or the
/// (out-of-scope) debug shell to fetch.
pub fn get_buffer() -> &'static [u8; LOG_BUF_SIZE] {
    unsafe { &*core::ptr::addr_of!(LOG_BUFFER) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_macro_appends_formatted_line() {
        let before = WRITE_POS.load(Ordering::Relaxed);
        log!("pcpu {} entered vm {}", 3, 1);
        let after = WRITE_POS.load(Ordering::Relaxed);
        assert!(after > before);
    }
}
