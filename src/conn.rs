use crate::dlp::{self, DlpArg, DlpResponse};
use crate::error::{Error, ErrorKind, Result};
use crate::netsync::NetSync;
use crate::padp::Padp;
use crate::slp::SlpAddr;
use crate::transport::net::{NetConfig, NetTransport};
use crate::transport::serial::{SerialOptions, SerialTransport};
use crate::transport::Transport;
use std::time::Duration;
use tracing::{debug, warn};

/// Which protocols carry DLP for this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStack {
    /// DLP over PADP over SLP over a byte stream. Cradles and most
    /// serial devices.
    Full,
    /// DLP over NetSync framing over a byte stream. The USB M50x
    /// class; the opening ritual statement arrives unframed.
    Simple,
    /// DLP over NetSync framing over TCP, with the UDP wakeup dance
    /// first.
    Net,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Constructed but not yet through the handshake.
    New,
    /// Session established.
    Up,
    /// The device stopped answering or the transport failed. No further
    /// I/O is possible.
    Lost,
    Closed,
}

/// The framing layer that carries DLP messages: PADP+SLP or NetSync.
enum Framing {
    Padp(Padp),
    NetSync(NetSync),
}

impl Framing {
    fn read(&mut self, io: &mut dyn Transport) -> Result<usize> {
        match self {
            Framing::Padp(padp) => padp.read(io),
            Framing::NetSync(netsync) => netsync.read(io),
        }
    }

    fn message(&self, len: usize) -> &[u8] {
        match self {
            Framing::Padp(padp) => padp.message(len),
            Framing::NetSync(netsync) => netsync.message(len),
        }
    }

    fn write(&mut self, io: &mut dyn Transport, buf: &[u8]) -> Result<()> {
        match self {
            Framing::Padp(padp) => padp.write(io, buf),
            Framing::NetSync(netsync) => netsync.write(io, buf),
        }
    }
}

/// A connection to a handheld: the transport plus every layer of
/// per-session protocol state. All I/O on the stack goes through one of
/// these, one request/response at a time.
pub struct Connection {
    io: Box<dyn Transport>,
    framing: Framing,
    stack: ProtocolStack,
    status: Status,
    last_error: Option<ErrorKind>,
}

impl Connection {
    /// Open a serial (or USB-as-serial) device for a full-stack session.
    pub fn open_serial(device: &str, opts: SerialOptions) -> Result<Connection> {
        let io = SerialTransport::open(device, opts)?;
        Ok(Connection::assemble(Box::new(io), ProtocolStack::Full))
    }

    /// Open a USB M50x-class device: serial-style byte stream, NetSync
    /// framing.
    pub fn open_usb_m50x(device: &str, opts: SerialOptions) -> Result<Connection> {
        let io = SerialTransport::open(device, opts)?;
        Ok(Connection::assemble(Box::new(io), ProtocolStack::Simple))
    }

    /// Start listening for a NetSync (TCP) session.
    pub fn open_net(config: NetConfig) -> Result<Connection> {
        let io = NetTransport::open(config)?;
        Ok(Connection::assemble(Box::new(io), ProtocolStack::Net))
    }

    /// Run the stack over a transport you already own (tests, tunnels).
    pub fn from_transport(io: Box<dyn Transport>, stack: ProtocolStack) -> Connection {
        Connection::assemble(io, stack)
    }

    fn assemble(io: Box<dyn Transport>, stack: ProtocolStack) -> Connection {
        let framing = match stack {
            ProtocolStack::Full => Framing::Padp(Padp::new()),
            ProtocolStack::Simple | ProtocolStack::Net => Framing::NetSync(NetSync::new()),
        };
        Connection {
            io,
            framing,
            stack,
            status: Status::New,
            last_error: None,
        }
    }

    /// Set the SLP address this connection answers to. Only meaningful
    /// on the full stack; a HotSync session binds
    /// `(packet_type::PAD, port::DLP)`.
    pub fn bind(&mut self, addr: SlpAddr) {
        if let Framing::Padp(padp) = &mut self.framing {
            padp.bind(addr);
        }
    }

    /// Wait for the device and run whatever handshake the stack needs:
    /// the socket-level accept for NetSync transports, then the ritual
    /// exchange for NetSync framing. On success the connection is up.
    pub fn accept(&mut self) -> Result<()> {
        if let Err(e) = self.io.accept() {
            return Err(self.fail(e));
        }
        let ritual = match &mut self.framing {
            Framing::Padp(_) => Ok(()),
            Framing::NetSync(netsync) => {
                let first_raw = self.stack == ProtocolStack::Simple;
                netsync.ritual(self.io.as_mut(), first_raw)
            }
        };
        match ritual {
            Ok(()) => {
                debug!("connection up");
                self.status = Status::Up;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// The classification of the most recent failure, if any. Mostly
    /// interesting after the connection has gone to [`Status::Lost`].
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// How long a read waits for the device before reporting a timeout.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        match &mut self.framing {
            Framing::Padp(padp) => padp.set_read_timeout(timeout),
            Framing::NetSync(netsync) => netsync.set_read_timeout(timeout),
        }
    }

    /// How long the full stack waits for a fragment ACK before
    /// resending. No effect on NetSync framing, which has no ACKs.
    pub fn set_ack_timeout(&mut self, timeout: Duration) {
        if let Framing::Padp(padp) = &mut self.framing {
            padp.set_ack_timeout(timeout);
        }
    }

    /// One DLP exchange: send the request, receive the matching
    /// response. The returned arguments borrow the connection's inbound
    /// buffer and are valid until the next call.
    ///
    /// A request that times out waiting for data is re-sent a few times
    /// before the timeout becomes terminal; some serial drivers lose
    /// inbound data wholesale.
    pub fn dlp_request(&mut self, cmd: u8, args: &[DlpArg<'_>]) -> Result<DlpResponse<'_>> {
        if self.status != Status::Up {
            // Refused outright; keep whatever failure took the
            // connection down as the last error.
            return Err(Error::NotConnected);
        }
        let request = dlp::encode_request(cmd, args);
        let mut msg_len = None;
        for attempt in 0..dlp::DLP_MAX_TRIES {
            if attempt > 0 {
                warn!(
                    "no response to request {:#04x}; re-sending (attempt {})",
                    cmd,
                    attempt + 1
                );
            }
            if let Err(e) = self.framing.write(self.io.as_mut(), &request) {
                return Err(self.fail(e));
            }
            match self.framing.read(self.io.as_mut()) {
                Ok(len) => {
                    msg_len = Some(len);
                    break;
                }
                Err(Error::ReadTimeout) => continue,
                Err(e) => return Err(self.fail(e)),
            }
        }
        let Some(len) = msg_len else {
            return Err(self.fail(Error::Timeout));
        };
        let response = dlp::parse_response(cmd, self.framing.message(len))?;
        Ok(response)
    }

    /// Shut the session down and release the transport.
    pub fn close(mut self) -> Result<()> {
        debug!("closing connection");
        self.status = Status::Closed;
        self.io.close()?;
        Ok(())
    }

    /// Record a failure, and take the connection down if it is the kind
    /// there is no coming back from.
    fn fail(&mut self, e: Error) -> Error {
        self.last_error = Some(e.kind());
        if e.is_fatal() {
            warn!("connection lost: {}", e);
            self.status = Status::Lost;
        }
        e
    }
}
