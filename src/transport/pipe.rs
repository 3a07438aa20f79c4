/*! An in-memory transport pair.

Mostly useful for tests and for embedders that already own both ends of a
byte stream. Each `write_all` delivers one message to the peer; reads
drain messages byte by byte, so framing layers that read a header in
small pieces work unchanged.
*/

use crate::error::Result;
use crate::transport::{Direction, Transport, Wait};
use std::collections::VecDeque;
use std::io;
use std::sync::mpsc;
use std::time::Duration;

/// Backstop so a buggy peer can't hang a read forever.
const RECV_BACKSTOP: Duration = Duration::from_secs(30);

pub struct PipeTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    closed: bool,
}

/// Create a connected pair of in-memory transports.
pub fn pair() -> (PipeTransport, PipeTransport) {
    let (tx_a, rx_b) = mpsc::channel();
    let (tx_b, rx_a) = mpsc::channel();
    let a = PipeTransport {
        tx: tx_a,
        rx: rx_a,
        pending: VecDeque::new(),
        closed: false,
    };
    let b = PipeTransport {
        tx: tx_b,
        rx: rx_b,
        pending: VecDeque::new(),
        closed: false,
    };
    (a, b)
}

impl Transport for PipeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.rx.recv_timeout(RECV_BACKSTOP) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe read stalled"))
                }
            }
        }
        let mut n = 0;
        while n < buf.len() {
            match self.pending.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }

    fn wait(&mut self, dir: Direction, timeout: Duration) -> Result<Wait> {
        match dir {
            Direction::Write => Ok(Wait::Ready),
            Direction::Read => {
                if !self.pending.is_empty() || self.closed {
                    return Ok(Wait::Ready);
                }
                match self.rx.recv_timeout(timeout) {
                    Ok(chunk) => {
                        self.pending.extend(chunk);
                        Ok(Wait::Ready)
                    }
                    // A hung-up peer is "readable": the next read reports EOF.
                    Err(mpsc::RecvTimeoutError::Disconnected) => Ok(Wait::Ready),
                    Err(mpsc::RecvTimeoutError::Timeout) => Ok(Wait::TimedOut),
                }
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}
