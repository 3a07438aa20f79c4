/*! PADP, the Packet Assembly/Disassembly Protocol.

PADP turns SLP's unreliable, size-limited datagrams into a reliable
exchange of whole messages. Outbound messages are sliced into fragments
of at most 1024 payload bytes, each of which must be acknowledged before
the next goes out; lost packets and lost ACKs are covered by resending.
Inbound fragments are reassembled in offset order into a grow-only
message buffer.

A note on the `size` field: on the first fragment of a message it holds
the *total* message length; on every later fragment it holds the offset
the fragment starts at. The receiver uses that to pre-size its buffer
and to reject duplicated or reordered fragments.

PADP and SLP share the transaction id: the SLP xid of a data packet is
the PADP transaction, and an ACK is stamped with the xid of the packet
it acknowledges.
*/

use crate::error::{Error, ProtocolError, Result};
use crate::slp::{Slp, SlpAddr};
use crate::transport::{Direction, Transport, Wait};
use crate::util::grow_to;
use bytes::{Buf, BufMut};
use std::time::Duration;
use tracing::{debug, trace, warn};

pub(crate) const PADP_HEADER_LEN: usize = 4;
/// Largest fragment payload we will put on the wire.
pub(crate) const PADP_MAX_PACKET_LEN: usize = 1024;
/// Attempts per fragment before the connection is declared dead.
const PADP_MAX_RETRIES: u32 = 5;
/// How long to wait for an ACK before resending.
const PADP_ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// Default wait for the next inbound message.
pub(crate) const PADP_READ_TIMEOUT: Duration = Duration::from_secs(30);

const FLAG_FIRST: u8 = 0x80;
const FLAG_LAST: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragmentType {
    Data,
    Ack,
    Tickle,
    Abort,
    /// Obsolete; ignored on receive.
    Nak,
    Unknown(u8),
}

impl From<u8> for FragmentType {
    fn from(code: u8) -> Self {
        match code {
            1 => FragmentType::Data,
            2 => FragmentType::Ack,
            3 => FragmentType::Tickle,
            4 => FragmentType::Abort,
            5 => FragmentType::Nak,
            n => FragmentType::Unknown(n),
        }
    }
}

impl FragmentType {
    fn code(self) -> u8 {
        match self {
            FragmentType::Data => 1,
            FragmentType::Ack => 2,
            FragmentType::Tickle => 3,
            FragmentType::Abort => 4,
            FragmentType::Nak => 5,
            FragmentType::Unknown(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FragmentHeader {
    kind: FragmentType,
    flags: u8,
    size: u16,
}

impl FragmentHeader {
    fn parse(mut buf: &[u8]) -> FragmentHeader {
        FragmentHeader {
            kind: FragmentType::from(buf.get_u8()),
            flags: buf.get_u8(),
            size: buf.get_u16(),
        }
    }
}

/// One PADP endpoint, owning the SLP framer beneath it.
pub struct Padp {
    slp: Slp,
    /// Current outbound transaction id.
    xid: u8,
    /// xid of the last message delivered upward, for spotting resends of
    /// data whose ACK the device never saw.
    last_delivered: Option<u8>,
    read_timeout: Duration,
    ack_timeout: Duration,
    /// Message buffer; multi-fragment messages reassemble here and
    /// single-fragment payloads land here too, so the layer above always
    /// borrows from one place.
    inbuf: Vec<u8>,
}

impl Padp {
    pub fn new() -> Padp {
        Padp {
            slp: Slp::new(),
            xid: 0,
            last_delivered: None,
            read_timeout: PADP_READ_TIMEOUT,
            ack_timeout: PADP_ACK_TIMEOUT,
            inbuf: Vec::new(),
        }
    }

    pub fn bind(&mut self, addr: SlpAddr) {
        self.slp.bind(addr);
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn set_ack_timeout(&mut self, timeout: Duration) {
        self.ack_timeout = timeout;
    }

    /// Pick a new transaction id, skipping the reserved values 0x00 and
    /// 0xff.
    fn bump_xid(&mut self) {
        self.xid = self.xid.wrapping_add(1);
        if self.xid == 0xff || self.xid == 0x00 {
            self.xid = 0x01;
        }
    }

    fn send_fragment(
        &mut self,
        io: &mut dyn Transport,
        header: FragmentHeader,
        payload: &[u8],
    ) -> Result<()> {
        trace!(
            "PADP TX: type {:?}, flags {:#04x}, size {}, payload {}, xid {:#04x}",
            header.kind,
            header.flags,
            header.size,
            payload.len(),
            self.xid
        );
        let mut out = Vec::with_capacity(PADP_HEADER_LEN + payload.len());
        out.put_u8(header.kind.code());
        out.put_u8(header.flags);
        out.put_u16(header.size);
        out.extend_from_slice(payload);
        self.slp.write_packet(io, &out, self.xid)
    }

    /// ACK the packet just received, echoing its flags and size and
    /// stamping the ACK with that packet's xid.
    fn send_ack(&mut self, io: &mut dyn Transport, flags: u8, size: u16) -> Result<()> {
        self.xid = self.slp.last_xid();
        let header = FragmentHeader {
            kind: FragmentType::Ack,
            flags,
            size,
        };
        self.send_fragment(io, header, &[])
    }

    /// Wait up to `timeout` for one SLP packet and parse its PADP header.
    /// Returns the header and the SLP payload length.
    fn recv_fragment(
        &mut self,
        io: &mut dyn Transport,
        timeout: Duration,
    ) -> Result<(FragmentHeader, u16)> {
        if io.wait(Direction::Read, timeout)? == Wait::TimedOut {
            return Err(Error::ReadTimeout);
        }
        let len = self.slp.read_packet(io)?;
        if (len as usize) < PADP_HEADER_LEN {
            return Err(ProtocolError::Truncated.into());
        }
        let header = FragmentHeader::parse(self.slp.payload(len));
        trace!(
            "PADP RX: type {:?}, flags {:#04x}, size {}, xid {:#04x}",
            header.kind,
            header.flags,
            header.size,
            self.slp.last_xid()
        );
        Ok((header, len))
    }

    /// Wait for a DATA fragment, absorbing tickles, obsolete NAKs, stray
    /// ACKs and resends of already-delivered data along the way.
    fn recv_data_fragment(&mut self, io: &mut dyn Transport) -> Result<(FragmentHeader, u16)> {
        loop {
            let (header, len) = self.recv_fragment(io, self.read_timeout)?;
            match header.kind {
                FragmentType::Data => {
                    if self.last_delivered == Some(self.slp.last_xid()) {
                        // The device never saw our ACK and resent the
                        // message; ACK it again and keep waiting.
                        debug!("duplicate data packet; acknowledging again");
                        self.send_ack(io, header.flags, header.size)?;
                        continue;
                    }
                    return Ok((header, len));
                }
                FragmentType::Ack => warn!("unexpected ACK while waiting for data"),
                FragmentType::Tickle => trace!("tickle"),
                FragmentType::Nak => trace!("obsolete NAK; ignoring"),
                FragmentType::Abort => return Err(Error::Aborted),
                FragmentType::Unknown(n) => {
                    return Err(ProtocolError::BadFragmentType(n).into())
                }
            }
        }
    }

    /// Read one whole message, reassembling fragments as needed. Returns
    /// its length; the bytes are in [`Padp::message`].
    pub fn read(&mut self, io: &mut dyn Transport) -> Result<usize> {
        let (header, len) = self.recv_data_fragment(io)?;
        let xid = self.slp.last_xid();

        if header.flags & FLAG_FIRST == 0 {
            return Err(ProtocolError::BadFragmentFlags(header.flags).into());
        }

        if header.flags & FLAG_LAST != 0 {
            // The whole message fits in this fragment
            let size = header.size as usize;
            let body = &self.slp.payload(len)[PADP_HEADER_LEN..];
            if body.len() < size {
                return Err(ProtocolError::Truncated.into());
            }
            grow_to(&mut self.inbuf, size);
            let body = &self.slp.payload(len)[PADP_HEADER_LEN..];
            self.inbuf[..size].copy_from_slice(&body[..size]);
            self.send_ack(io, header.flags, header.size)?;
            self.last_delivered = Some(xid);
            return Ok(size);
        }

        // First of several fragments: size holds the total message length
        let total = header.size as usize;
        debug!("multi-fragment message, {} bytes total", total);
        grow_to(&mut self.inbuf, total);
        let first_len = len as usize - PADP_HEADER_LEN;
        if first_len > total {
            return Err(ProtocolError::FragmentOverrun.into());
        }
        {
            let body = &self.slp.payload(len)[PADP_HEADER_LEN..];
            self.inbuf[..first_len].copy_from_slice(body);
        }
        self.send_ack(io, header.flags, header.size)?;

        let mut offset = first_len;
        loop {
            let (header, len) = self.recv_data_fragment(io)?;
            if header.flags & FLAG_FIRST != 0 {
                warn!("new first fragment in the middle of a message");
                return Err(ProtocolError::BadFragmentFlags(header.flags).into());
            }
            // On continuations, size is the offset this fragment starts at
            if header.size as usize != offset {
                return Err(ProtocolError::BadOffset {
                    expected: offset as u16,
                    got: header.size,
                }
                .into());
            }
            let frag_len = len as usize - PADP_HEADER_LEN;
            if offset + frag_len > total {
                return Err(ProtocolError::FragmentOverrun.into());
            }
            {
                let body = &self.slp.payload(len)[PADP_HEADER_LEN..];
                self.inbuf[offset..offset + frag_len].copy_from_slice(body);
            }
            offset += frag_len;
            self.send_ack(io, header.flags, header.size)?;
            if header.flags & FLAG_LAST != 0 {
                break;
            }
        }
        self.last_delivered = Some(xid);
        Ok(offset)
    }

    /// The message most recently returned by [`Padp::read`].
    pub fn message(&self, len: usize) -> &[u8] {
        &self.inbuf[..len]
    }

    /// Send one message, fragmenting as needed. Each fragment is resent
    /// until acknowledged; five consecutive timeouts on any one fragment
    /// end the session.
    pub fn write(&mut self, io: &mut dyn Transport, buf: &[u8]) -> Result<()> {
        if buf.len() > u16::MAX as usize {
            return Err(ProtocolError::MessageTooLong(buf.len()).into());
        }
        self.bump_xid();
        debug!("PADP write, {} bytes, xid {:#04x}", buf.len(), self.xid);

        let mut offset = 0;
        while offset < buf.len() {
            let frag_len = PADP_MAX_PACKET_LEN.min(buf.len() - offset);
            let mut flags = 0;
            if offset == 0 {
                flags |= FLAG_FIRST;
            }
            if buf.len() - offset <= PADP_MAX_PACKET_LEN {
                flags |= FLAG_LAST;
            }
            let header = FragmentHeader {
                kind: FragmentType::Data,
                flags,
                // Total length up front, cumulative offset afterwards
                size: if offset == 0 { buf.len() as u16 } else { offset as u16 },
            };

            let mut attempt = 0;
            let mut acked = false;
            while !acked && attempt < PADP_MAX_RETRIES {
                if io.wait(Direction::Write, self.ack_timeout)? == Wait::TimedOut {
                    warn!("write timeout; trying again");
                    attempt += 1;
                    continue;
                }
                self.send_fragment(io, header, &buf[offset..offset + frag_len])?;

                // Wait for the ACK. Tickles don't consume attempts;
                // timeouts do.
                loop {
                    let (reply, _) = match self.recv_fragment(io, self.ack_timeout) {
                        Ok(got) => got,
                        Err(Error::ReadTimeout) => {
                            warn!("ACK timeout; resending");
                            attempt += 1;
                            break;
                        }
                        Err(e) => return Err(e),
                    };
                    match reply.kind {
                        FragmentType::Ack => {
                            let got = self.slp.last_xid();
                            if got != self.xid {
                                return Err(ProtocolError::AckXid {
                                    expected: self.xid,
                                    got,
                                }
                                .into());
                            }
                            acked = true;
                            break;
                        }
                        FragmentType::Data => {
                            // Either our ACK to the previous exchange got
                            // lost and the device is resending, or a stale
                            // session left a packet in flight. ACK it so
                            // the device moves on, take a fresh xid, and
                            // resend our fragment.
                            warn!("unexpected data packet; acknowledging it");
                            self.send_ack(io, reply.flags, reply.size)?;
                            self.bump_xid();
                            break;
                        }
                        FragmentType::Tickle => trace!("tickle"),
                        FragmentType::Nak => trace!("obsolete NAK; ignoring"),
                        FragmentType::Abort => return Err(Error::Aborted),
                        FragmentType::Unknown(n) => {
                            return Err(ProtocolError::BadFragmentType(n).into())
                        }
                    }
                }
            }
            if !acked {
                debug!("reached the retry limit; giving up");
                return Err(Error::Timeout);
            }
            offset += frag_len;
        }
        Ok(())
    }
}
