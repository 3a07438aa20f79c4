/*! NetSync TCP/UDP backend.

A NetSync session opens backwards from what you might expect: the
desktop is the *server*. The handheld broadcasts a wakeup datagram on a
well-known UDP port; we acknowledge it, then listen on the TCP data port
and let the handheld connect. From then on the connection is a plain TCP
byte stream (the NetSync framing above it provides message boundaries).
*/

use crate::error::{Error, Result};
use crate::netsync::Wakeup;
use crate::transport::{Direction, Transport, Wait};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

/// UDP port the handheld sends its wakeup datagram to.
pub const NETSYNC_WAKEUP_PORT: u16 = 14237;
/// TCP port the session data flows over.
pub const NETSYNC_DATA_PORT: u16 = 14238;

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub wakeup_port: u16,
    pub data_port: u16,
}

impl Default for NetConfig {
    fn default() -> NetConfig {
        NetConfig {
            wakeup_port: NETSYNC_WAKEUP_PORT,
            data_port: NETSYNC_DATA_PORT,
        }
    }
}

enum Socket {
    /// Waiting for the wakeup datagram.
    Wakeup(UdpSocket),
    /// Session established.
    Data(TcpStream),
}

pub struct NetTransport {
    config: NetConfig,
    sock: Socket,
}

impl NetTransport {
    /// Bind the UDP wakeup socket. The session proper starts in
    /// [`Transport::accept`].
    pub fn open(config: NetConfig) -> Result<NetTransport> {
        let udp = UdpSocket::bind(("0.0.0.0", config.wakeup_port))?;
        debug!("listening for wakeup datagrams on {:?}", udp.local_addr());
        Ok(NetTransport {
            config,
            sock: Socket::Wakeup(udp),
        })
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        match &mut self.sock {
            Socket::Data(stream) => Ok(stream),
            Socket::Wakeup(_) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no NetSync session accepted yet",
            )),
        }
    }
}

impl Transport for NetTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream()?.write_all(buf)
    }

    fn wait(&mut self, dir: Direction, timeout: Duration) -> Result<Wait> {
        match dir {
            Direction::Write => Ok(Wait::Ready),
            Direction::Read => {
                let stream = self.stream()?;
                stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
                let mut peek = [0u8; 1];
                let waited = match stream.peek(&mut peek) {
                    // 0 means the peer hung up; that's "readable" too, and
                    // the next read will report EOF.
                    Ok(_) => Ok(Wait::Ready),
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        Ok(Wait::TimedOut)
                    }
                    Err(e) => Err(Error::Io(e)),
                };
                stream.set_read_timeout(None)?;
                waited
            }
        }
    }

    fn accept(&mut self) -> Result<()> {
        let udp = match &self.sock {
            Socket::Wakeup(udp) => udp,
            Socket::Data(_) => return Ok(()),
        };

        // Wait for a wakeup datagram; anything without the magic leading
        // uword is not for us.
        let mut buf = [0u8; 1024];
        let (wakeup, peer) = loop {
            let (len, peer) = udp.recv_from(&mut buf)?;
            debug!("datagram from {}, {} bytes", peer, len);
            match Wakeup::parse(&buf[..len]) {
                Some(pkt) => break (pkt, peer),
                None => warn!("not a wakeup packet; ignoring"),
            }
        };
        debug!(
            "wakeup: hostid {:#010x}, netmask {:#010x}, hostname {:?}",
            wakeup.hostid,
            wakeup.netmask,
            String::from_utf8_lossy(&wakeup.hostname)
        );
        udp.send_to(&wakeup.ack().encode(), peer)?;

        // The UDP socket is done; the data connection is TCP.
        let listener = TcpListener::bind(("0.0.0.0", self.config.data_port))?;
        let (stream, peer) = listener.accept()?;
        debug!("accepted TCP connection from {}", peer);
        stream.set_nodelay(true).ok();
        self.sock = Socket::Data(stream);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Socket::Data(stream) = &self.sock {
            stream.shutdown(Shutdown::Both).ok();
        }
        Ok(())
    }
}
