//! Byte-level access to a WR device console.
//!
//! The command channel only needs a handful of primitives from the link: single
//! byte writes (so it can space characters out), line reads and bounded reads
//! with a read deadline, and a way to throw away stale buffered bytes. Serial
//! ports provide them through [`SerialTransport`]; tests and the simulator
//! provide them in memory.

use std::io::{self, Read, Write};
use std::time::Duration;

use tracing::debug;

/// Prefix of the USB serial devices the WR boards enumerate as.
pub const USB_SERIAL_PREFIX: &str = "/dev/ttyUSB";

pub trait Transport {
    /// Writes one byte, returning how many bytes the link accepted.
    ///
    /// A write that cannot complete before the write deadline must fail with
    /// [`io::ErrorKind::TimedOut`].
    fn write_byte(&mut self, byte: u8) -> io::Result<usize>;

    /// Blocks until every written byte has left the host.
    fn flush(&mut self) -> io::Result<()>;

    /// Discards any buffered input and output.
    fn clear(&mut self) -> io::Result<()>;

    /// Reads up to and including the next `\n`. When the read deadline expires
    /// first, whatever arrived so far is returned (possibly nothing).
    fn read_line(&mut self) -> io::Result<Vec<u8>>;

    /// Reads until `max` bytes arrived or the read deadline expires.
    fn read_up_to(&mut self, max: usize) -> io::Result<Vec<u8>>;
}

/// Timing of a serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialTiming {
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for SerialTiming {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(100),
        }
    }
}

/// A [`Transport`] over a native serial port.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    timing: SerialTiming,
}

impl SerialTransport {
    /// Opens the serial port at `path`.
    pub fn open(path: &str, timing: SerialTiming) -> Result<Self, serialport::Error> {
        let port = serialport::new(path, timing.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timing.read_timeout)
            .open()?;
        port.clear(serialport::ClearBuffer::Output)?;
        debug!("Port {} successfully opened at {} baud", path, timing.baud_rate);
        Ok(Self {
            port,
            name: path.to_string(),
            timing,
        })
    }

    // serialport has a single timeout for both directions, so it is switched
    // before each direction change.
    fn use_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        if self.port.timeout() != timeout {
            self.port.set_timeout(timeout)?;
        }
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn write_byte(&mut self, byte: u8) -> io::Result<usize> {
        self.use_timeout(self.timing.write_timeout)?;
        self.port.write(&[byte])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn clear(&mut self) -> io::Result<()> {
        self.port.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        self.use_timeout(self.timing.read_timeout)?;
        let mut line = Vec::with_capacity(128);
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e),
            }
        }
        Ok(line)
    }

    fn read_up_to(&mut self, max: usize) -> io::Result<Vec<u8>> {
        self.use_timeout(self.timing.read_timeout)?;
        let mut data = vec![0u8; max];
        let mut filled = 0;
        while filled < max {
            match self.port.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e),
            }
        }
        data.truncate(filled);
        Ok(data)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!("Port {} closed", self.name);
    }
}
