/*!
 * Byte transport abstraction.
 *
 * This module defines the [`Transport`] trait at the serial channel
 * boundary, the production implementation over the `serialport` crate, and
 * an in-memory loopback used by tests and demos.
 */
use std::collections::VecDeque;
use std::fmt::Debug;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::{BoardError, Result};

/// A full-duplex serial byte channel
pub trait Transport: Send + Debug {
    /// Number of bytes available to read without blocking
    fn bytes_available(&mut self) -> Result<usize>;

    /// Read exactly `buf.len()` bytes
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Write all of `bytes`
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Close the channel; subsequent operations fail
    fn close(&mut self) -> Result<()>;

    /// Read a single byte
    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}

/// Transport over a physical serial port
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    path: String,
}

impl SerialTransport {
    /// Open a serial port at the given path and baud rate
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_secs(1))
            .open()?;
        debug!(path, baud_rate, "serial port opened");
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    /// The path this transport was opened on
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .finish()
    }
}

impl Transport for SerialTransport {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.port.read_exact(buf)?;
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle releases the port; nothing else to do here
        debug!(path = %self.path, "serial port closed");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LoopbackInner {
    /// Device-to-host bytes waiting to be read
    incoming: VecDeque<u8>,
    /// Host-to-device bytes written so far
    written: Vec<u8>,
    faulted: bool,
    closed: bool,
}

/// An in-memory transport for tests and demos.
///
/// Clones share the same buffers: the test keeps one clone to script the
/// device side while the board owns the other.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Mutex<LoopbackInner>>,
}

impl LoopbackTransport {
    /// Create an empty loopback transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the board to read, as if the device sent them
    pub fn push_incoming(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.incoming.extend(bytes.iter().copied());
    }

    /// All bytes the board has written so far
    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().unwrap().written.clone()
    }

    /// Take and clear the bytes the board has written
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().written)
    }

    /// Inject a channel fault; every subsequent operation fails
    pub fn fail(&self) {
        self.inner.lock().unwrap().faulted = true;
    }

    /// Whether the board has closed the transport
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn check(inner: &LoopbackInner) -> Result<()> {
        if inner.faulted {
            return Err(BoardError::Transport("simulated channel fault".into()));
        }
        if inner.closed {
            return Err(BoardError::Transport("transport is closed".into()));
        }
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn bytes_available(&mut self) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        Ok(inner.incoming.len())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        if inner.incoming.len() < buf.len() {
            return Err(BoardError::Transport(
                "loopback underrun: read past available bytes".into(),
            ));
        }
        for slot in buf.iter_mut() {
            *slot = inner.incoming.pop_front().unwrap();
        }
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        inner.written.extend_from_slice(bytes);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_round_trip() {
        let device = LoopbackTransport::new();
        let mut board_side = device.clone();

        device.push_incoming(&[1, 2, 3]);
        assert_eq!(board_side.bytes_available().unwrap(), 3);
        assert_eq!(board_side.read_byte().unwrap(), 1);
        let mut buf = [0u8; 2];
        board_side.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
        assert_eq!(board_side.bytes_available().unwrap(), 0);

        board_side.write_all(&[9, 8]).unwrap();
        assert_eq!(device.written(), vec![9, 8]);
        assert_eq!(device.take_written(), vec![9, 8]);
        assert!(device.written().is_empty());
    }

    #[test]
    fn test_loopback_underrun() {
        let device = LoopbackTransport::new();
        let mut board_side = device.clone();
        let mut buf = [0u8; 4];
        assert!(matches!(
            board_side.read_exact(&mut buf),
            Err(BoardError::Transport(_))
        ));
    }

    #[test]
    fn test_loopback_fault() {
        let device = LoopbackTransport::new();
        let mut board_side = device.clone();
        device.push_incoming(&[1]);
        device.fail();
        assert!(board_side.bytes_available().is_err());
        assert!(board_side.write_all(&[0]).is_err());
    }

    #[test]
    fn test_loopback_close() {
        let device = LoopbackTransport::new();
        let mut board_side = device.clone();
        board_side.close().unwrap();
        assert!(device.is_closed());
        assert!(board_side.write_all(&[0]).is_err());
    }
}
