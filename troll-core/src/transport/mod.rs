//! Byte transport module.
//!
//! Both probe clients talk to their firmware over a plain byte stream. The
//! stream is abstracted so the clients can be driven by a serial port or by
//! an in-memory script.

mod mock;
#[cfg(feature = "hardware")]
mod serial;

pub use mock::{MockHandle, MockTransport};
#[cfg(feature = "hardware")]
pub use serial::SerialTransport;

use crate::error::Result;
use std::time::{Duration, Instant};

/// A bidirectional byte stream with modem control lines.
pub trait Transport: Send {
    /// Write all of `data` and wait for the write to complete.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes that can be read without blocking.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Read at most `buf.len()` already available bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Block until data is available or `timeout` elapses.
    ///
    /// Returns whether data became available.
    fn wait_for_ready_read(&mut self, timeout: Duration) -> Result<bool>;

    fn set_data_terminal_ready(&mut self, level: bool) -> Result<()>;

    /// Everything currently available.
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let available = self.bytes_available()?;
        let mut buf = vec![0u8; available];
        let n = self.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read one byte, waiting at most `timeout` for it.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
        let deadline = Instant::now() + timeout;
        while self.bytes_available()? == 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.wait_for_ready_read(remaining)? {
                return Ok(None);
            }
        }
        let mut byte = [0u8; 1];
        if self.read(&mut byte)? == 1 {
            Ok(Some(byte[0]))
        } else {
            Ok(None)
        }
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn bytes_available(&mut self) -> Result<usize> {
        (**self).bytes_available()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn wait_for_ready_read(&mut self, timeout: Duration) -> Result<bool> {
        (**self).wait_for_ready_read(timeout)
    }

    fn set_data_terminal_ready(&mut self, level: bool) -> Result<()> {
        (**self).set_data_terminal_ready(level)
    }
}
