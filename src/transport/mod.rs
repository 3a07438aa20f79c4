/*! The byte-stream backends a [`Connection`](crate::Connection) can run on.

Every backend exposes the same six operations: read up to N bytes, write
exactly N bytes, wait until readable/writable with a timeout, drain, a
backend-specific `accept` handshake, and close. The protocol layers above
see nothing else.
*/

pub mod net;
pub mod pipe;
pub mod serial;

use crate::error::{Error, Result};
use std::io;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Outcome of a bounded [`Transport::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Ready,
    TimedOut,
}

pub trait Transport {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Wait until the stream is readable (or writable), or `timeout`
    /// elapses. No suspension point in the stack is unbounded; they all
    /// come through here or through a timed read.
    fn wait(&mut self, dir: Direction, timeout: Duration) -> Result<Wait>;

    /// Flush anything buffered toward the device. A no-op for sockets.
    fn drain(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Perform any backend-specific handshake that must precede the first
    /// upward frame. A no-op for plain serial lines.
    fn accept(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Fill `buf` completely, treating a zero-length read as EOF.
pub(crate) fn read_exact(io: &mut dyn Transport, buf: &mut [u8]) -> Result<()> {
    let mut got = 0;
    while got < buf.len() {
        match io.read(&mut buf[got..])? {
            0 => return Err(Error::Eof),
            n => got += n,
        }
    }
    Ok(())
}
