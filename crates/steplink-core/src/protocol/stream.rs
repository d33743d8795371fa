//! Byte-stream device abstraction

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Byte-stream device the transport runs over.
///
/// `read` returns an empty buffer when nothing arrived within `timeout`; a
/// timeout is not an error at this layer.
pub trait SerialDevice: Send {
    /// Read up to `max` bytes, waiting at most `timeout` for the first one
    fn read(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>>;

    /// Write all bytes
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Drive the DTR line (used to reset the firmware)
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;

    /// Discard anything pending in the input buffer
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<D: SerialDevice + ?Sized> SerialDevice for Box<D> {
    fn read(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        (**self).read(max, timeout)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write(data)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        (**self).set_dtr(level)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear_input()
    }
}

/// Serial port wrapper implementing SerialDevice
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    timeout: Option<Duration>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            timeout: None,
        }
    }

    /// Name of the underlying port, if the driver reports one
    pub fn name(&self) -> Option<String> {
        self.port.name()
    }

    fn apply_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        // Avoid an ioctl per byte when the timeout is unchanged
        if self.timeout != Some(timeout) {
            self.port
                .set_timeout(timeout)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            self.timeout = Some(timeout);
        }
        Ok(())
    }
}

impl SerialDevice for SerialChannel {
    fn read(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        self.apply_timeout(timeout)?;
        let mut buf = vec![0u8; max];
        match self.port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port
            .write_data_terminal_ready(level)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}
