//! Allocation-free output to standard error.
//!
//! Trace lines and lock-order reports are written from inside the allocator,
//! often with a heap lock held. `std` printing may allocate and re-enter the
//! allocator, so text is formatted through `core::fmt` straight into the file
//! descriptor instead.

use crate::platform;
use crate::sync::SpinLock;
use core::fmt::{self, Write};

/// Keeps lines from concurrent threads from interleaving.
static STDERR_LOCK: SpinLock = SpinLock::new();

/// `core::fmt::Write` over fd 2. Never allocates.
pub struct StderrWriter;

impl Write for StderrWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut buf = s.as_bytes();
        while !buf.is_empty() {
            let written = platform::write_stderr(buf);
            if written < 1 {
                return Err(fmt::Error);
            }
            buf = &buf[written as usize..];
        }
        Ok(())
    }
}

/// Write `args` and a newline as one line.
pub fn print_line(args: fmt::Arguments<'_>) {
    STDERR_LOCK.lock();
    let mut out = StderrWriter;
    let _ = out.write_fmt(args).and_then(|()| out.write_str("\n"));
    STDERR_LOCK.unlock();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_accepts_formatted_text() {
        let mut out = StderrWriter;
        let value = 7u64;
        assert!(writeln!(out, "[stderr] {} {:p} {:#x}", 42, &value, 255).is_ok());
        assert!(out.write_str("").is_ok());
    }

    #[test]
    fn test_print_line_releases_lock() {
        print_line(format_args!("[stderr] first"));
        print_line(format_args!("[stderr] second {}", 2));
        assert!(STDERR_LOCK.try_lock());
        STDERR_LOCK.unlock();
    }
}
