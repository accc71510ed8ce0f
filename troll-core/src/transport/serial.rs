use super::Transport;
use crate::config::Timeouts;
use crate::diagnostics::Diagnostics;
use crate::error::{Result, TargetError};
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// USB CDC serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    poll_interval: Duration,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerialTransport({:?})", self.port.name())
    }
}

impl SerialTransport {
    /// Open `port_name`.
    ///
    /// The baud rate is irrelevant for USB CDC devices, but the OS wants one.
    pub fn open(port_name: &str, baud_rate: u32, timeouts: &Timeouts, diagnostics: &Diagnostics) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeouts.write_complete())
            .open()?;
        let mut transport = Self { port, poll_interval: timeouts.poll_interval() };
        if let Err(e) = transport.port.clear(ClearBuffer::Input) {
            diagnostics.debug(format_args!("could not clear input buffer of {port_name}: {e}"));
        }
        Ok(transport)
    }

    pub fn name(&self) -> Option<String> {
        self.port.name()
    }
}

/// Timeouts and spurious wakeups are not failures on a polled port.
fn is_benign(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_benign(&e) => Ok(0),
            Err(e) => Err(TargetError::Io(e)),
        }
    }

    fn wait_for_ready_read(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.bytes_available()? > 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn set_data_terminal_ready(&mut self, level: bool) -> Result<()> {
        self.port.write_data_terminal_ready(level)?;
        Ok(())
    }
}
