/*! Serial and USB-as-serial backend.

The cradle is a raw 8N1 line. 9600 baud is required while the session is
being established; the upper layers may ask for more speed afterwards.
USB HotSync ports have the additional quirk that the device node only
exists once the user presses the button, so opening can optionally wait
for it to appear.
*/

use crate::error::{Error, Result};
use crate::transport::{Direction, Transport, Wait};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 9600 bps is required while the session handshake runs.
const HANDSHAKE_BAUD: u32 = 9600;
/// How long to sleep between open attempts on a not-yet-present device.
const ABSENT_RETRY: Duration = Duration::from_secs(5);
/// Polling granularity for the readable wait.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Timeout on raw reads once the line is readable. Generous: the wait
/// has already seen data.
const READ_STALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOptions {
    /// The device node may not exist yet (USB cradles); keep retrying the
    /// open until it does.
    pub transient: bool,
    /// Tell the user to press the HotSync button.
    pub prompt: bool,
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(device: &str, opts: SerialOptions) -> Result<SerialTransport> {
        if opts.prompt {
            eprintln!("Please press the HotSync button.");
        }
        let port = loop {
            let attempt = serialport::new(device, HANDSHAKE_BAUD)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(READ_STALL_TIMEOUT)
                .open();
            match attempt {
                Ok(port) => break port,
                Err(e) if opts.transient && device_absent(&e) => {
                    warn!("no device on {}; sleeping", device);
                    thread::sleep(ABSENT_RETRY);
                }
                Err(e) => return Err(Error::Io(io::Error::from(e))),
            }
        };
        debug!("opened {} at {} baud, raw", device, HANDSHAKE_BAUD);
        Ok(SerialTransport { port })
    }

    /// Switch the line rate. Only meaningful once both ends have agreed
    /// to leave the handshake speed.
    pub fn set_speed(&mut self, baud: u32) -> Result<()> {
        self.port
            .set_baud_rate(baud)
            .map_err(|e| Error::Io(io::Error::from(e)))
    }
}

fn device_absent(e: &serialport::Error) -> bool {
    matches!(
        e.kind,
        serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(io::ErrorKind::NotFound)
    )
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)
    }

    fn wait(&mut self, dir: Direction, timeout: Duration) -> Result<Wait> {
        match dir {
            // Writes land in the OS buffer; the line is effectively
            // always writable.
            Direction::Write => Ok(Wait::Ready),
            Direction::Read => {
                let start = Instant::now();
                loop {
                    let queued = self
                        .port
                        .bytes_to_read()
                        .map_err(|e| Error::Io(io::Error::from(e)))?;
                    if queued > 0 {
                        return Ok(Wait::Ready);
                    }
                    if start.elapsed() >= timeout {
                        return Ok(Wait::TimedOut);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn drain(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}
