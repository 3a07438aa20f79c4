/*! SLP, the Serial Link Protocol.

The bottom framing layer of a HotSync session: datagrams with a 3-byte
preamble, a checksummed 10-byte header carrying source/destination ports
and a protocol tag, and a trailing CRC-16 over the whole frame.

SLP's only response to damage of any kind is to drop the packet on the
floor and hunt for the next preamble, so none of that surfaces as an
error; the reader just keeps going until it has a well-formed packet
addressed to the bound port.
*/

use crate::crc::crc16;
use crate::error::Result;
use crate::transport::{self, Transport};
use crate::util::grow_to;
use bytes::{Buf, BufMut};
use tracing::{debug, trace, warn};

pub(crate) const SLP_PREAMBLE: [u8; 3] = [0xbe, 0xef, 0xed];
pub(crate) const SLP_HEADER_LEN: usize = 10;
pub(crate) const SLP_CRC_LEN: usize = 2;
const SLP_INIT_INBUF_LEN: usize = 1024;
const SLP_INIT_OUTBUF_LEN: usize = 1024;

/// Well-known SLP protocol tags.
pub mod packet_type {
    /// System packets (the remote debugger).
    pub const SYSTEM: u8 = 0;
    /// PADP rides under this tag.
    pub const PAD: u8 = 2;
    /// The loopback chatter the handheld emits before a HotSync.
    pub const LOOPBACK: u8 = 3;
}

/// Well-known SLP ports.
pub mod port {
    pub const DEBUGGER: u8 = 0;
    pub const CONSOLE: u8 = 1;
    pub const REMOTE_UI: u8 = 2;
    pub const DLP: u8 = 3;
}

/// An SLP address: a protocol tag plus a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlpAddr {
    pub protocol: u8,
    pub port: u8,
}

/// One SLP endpoint: the bound local address, the latched remote address,
/// and the grow-only packet buffers.
pub struct Slp {
    local: SlpAddr,
    remote: SlpAddr,
    header_inbuf: [u8; SLP_HEADER_LEN],
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    last_xid: u8,
}

impl Slp {
    pub fn new() -> Slp {
        let unbound = SlpAddr {
            protocol: 0,
            port: 0,
        };
        Slp {
            local: unbound,
            remote: unbound,
            header_inbuf: [0; SLP_HEADER_LEN],
            inbuf: vec![0; SLP_INIT_INBUF_LEN],
            outbuf: Vec::with_capacity(SLP_INIT_OUTBUF_LEN),
            last_xid: 0,
        }
    }

    /// Set the port this endpoint listens on. Packets addressed elsewhere
    /// (notably the handheld's pre-HotSync loopback traffic) are ignored.
    ///
    /// Until a packet has been received, replies target the mirror of the
    /// bound address; a HotSync peer talks DLP-socket to DLP-socket, so
    /// the two are the same.
    pub fn bind(&mut self, addr: SlpAddr) {
        self.local = addr;
        self.remote = addr;
    }

    /// Transaction id of the most recently accepted inbound packet. PADP
    /// stamps its ACKs with this.
    pub fn last_xid(&self) -> u8 {
        self.last_xid
    }

    /// Read one packet addressed to the bound port. Returns the payload
    /// length; the payload itself is in [`Slp::payload`]. Damaged or
    /// misaddressed packets are silently skipped.
    pub fn read_packet(&mut self, io: &mut dyn Transport) -> Result<u16> {
        loop {
            self.read_preamble(io)?;
            transport::read_exact(io, &mut self.header_inbuf[SLP_PREAMBLE.len()..])?;

            let mut h = &self.header_inbuf[SLP_PREAMBLE.len()..];
            let dest = h.get_u8();
            let src = h.get_u8();
            let protocol = h.get_u8();
            let size = h.get_u16();
            let xid = h.get_u8();
            let checksum = h.get_u8();
            trace!(
                "SLP header: {}->{}, proto {}, size {}, xid {:#04x}",
                src,
                dest,
                protocol,
                size,
                xid
            );

            // 8-bit sum of everything before the checksum byte
            let sum = self.header_inbuf[..SLP_HEADER_LEN - 1]
                .iter()
                .fold(0u8, |a, &b| a.wrapping_add(b));
            if sum != checksum {
                warn!(
                    "bad SLP header checksum: computed {:#04x}, packet says {:#04x}",
                    sum, checksum
                );
                continue;
            }

            // Remember whom to reply to
            self.remote = SlpAddr {
                protocol,
                port: src,
            };

            grow_to(&mut self.inbuf, size as usize);
            transport::read_exact(io, &mut self.inbuf[..size as usize])?;
            let mut crc_inbuf = [0u8; SLP_CRC_LEN];
            transport::read_exact(io, &mut crc_inbuf)?;

            // CRC of header || payload || CRC must come out zero
            let mut crc = crc16(&self.header_inbuf, 0);
            crc = crc16(&self.inbuf[..size as usize], crc);
            crc = crc16(&crc_inbuf, crc);
            if crc != 0 {
                warn!("bad SLP CRC (residue {:#06x}); dropping packet", crc);
                continue;
            }

            if protocol != self.local.protocol || dest != self.local.port {
                debug!(
                    "ignoring packet for ({}, {}); bound to ({}, {})",
                    protocol, dest, self.local.protocol, self.local.port
                );
                continue;
            }

            self.last_xid = xid;
            return Ok(size);
        }
    }

    /// The payload of the packet most recently returned by
    /// [`Slp::read_packet`].
    pub fn payload(&self, len: u16) -> &[u8] {
        &self.inbuf[..len as usize]
    }

    /// Hunt for the preamble byte by byte. Non-matching bytes are
    /// discarded; a mismatch that is itself the first preamble byte
    /// restarts the match one byte in, so a partial preamble followed by
    /// a real one still resynchronizes.
    fn read_preamble(&mut self, io: &mut dyn Transport) -> Result<()> {
        let mut matched = 0;
        while matched < SLP_PREAMBLE.len() {
            let mut byte = [0u8; 1];
            transport::read_exact(io, &mut byte)?;
            if byte[0] == SLP_PREAMBLE[matched] {
                matched += 1;
            } else if byte[0] == SLP_PREAMBLE[0] {
                trace!("skipping byte {:#04x} hunting for preamble", byte[0]);
                matched = 1;
            } else {
                trace!("skipping byte {:#04x} hunting for preamble", byte[0]);
                matched = 0;
            }
        }
        self.header_inbuf[..SLP_PREAMBLE.len()].copy_from_slice(&SLP_PREAMBLE);
        Ok(())
    }

    /// Frame `buf` and send it as one packet, stamped with `xid` (PADP's
    /// current transaction id).
    pub fn write_packet(&mut self, io: &mut dyn Transport, buf: &[u8], xid: u8) -> Result<()> {
        debug_assert!(buf.len() <= u16::MAX as usize);
        trace!("SLP write, {} byte payload, xid {:#04x}", buf.len(), xid);

        self.outbuf.clear();
        self.outbuf.put_slice(&SLP_PREAMBLE);
        self.outbuf.put_u8(self.remote.port); // dest
        self.outbuf.put_u8(self.local.port); // src
        self.outbuf.put_u8(self.local.protocol);
        self.outbuf.put_u16(buf.len() as u16);
        self.outbuf.put_u8(xid);
        let sum = self.outbuf.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        self.outbuf.put_u8(sum);
        self.outbuf.extend_from_slice(buf);
        let crc = crc16(&self.outbuf, 0);
        self.outbuf.put_u16(crc);

        io.write_all(&self.outbuf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe;

    const BOUND: SlpAddr = SlpAddr {
        protocol: packet_type::PAD,
        port: port::DLP,
    };

    /// Hand-build a frame the way the handheld would.
    fn frame(dest: u8, src: u8, protocol: u8, xid: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_slice(&SLP_PREAMBLE);
        out.put_u8(dest);
        out.put_u8(src);
        out.put_u8(protocol);
        out.put_u16(payload.len() as u16);
        out.put_u8(xid);
        let sum = out.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        out.put_u8(sum);
        out.extend_from_slice(payload);
        let crc = crc16(&out, 0);
        out.put_u16(crc);
        out
    }

    fn bound_slp() -> Slp {
        let mut slp = Slp::new();
        slp.bind(BOUND);
        slp
    }

    #[test]
    fn reads_a_valid_frame() {
        let (mut palm, mut host) = pipe::pair();
        palm.write_all(&frame(port::DLP, port::DLP, packet_type::PAD, 0x42, b"hello"))
            .unwrap();
        let mut slp = bound_slp();
        let len = slp.read_packet(&mut host).unwrap();
        assert_eq!(slp.payload(len), b"hello");
        assert_eq!(slp.last_xid(), 0x42);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (mut a, mut b) = pipe::pair();
        let mut tx = bound_slp();
        let mut rx = bound_slp();
        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        tx.write_packet(&mut a, &payload, 0x11).unwrap();
        let len = rx.read_packet(&mut b).unwrap();
        assert_eq!(rx.payload(len), &payload[..]);
        assert_eq!(rx.last_xid(), 0x11);
    }

    #[test]
    fn resynchronizes_past_garbage() {
        // Garbage prefixes, including partial preambles ending in the
        // first preamble byte
        for garbage in [
            &b"\x00\x01\x02"[..],
            &b"\xbe"[..],
            &b"\xbe\xef"[..],
            &b"\xbe\xef\xbe"[..],
            &b"\xff\xbe\xef"[..],
        ] {
            let (mut palm, mut host) = pipe::pair();
            let mut bytes = garbage.to_vec();
            bytes.extend_from_slice(&frame(port::DLP, port::DLP, packet_type::PAD, 1, b"ok"));
            palm.write_all(&bytes).unwrap();
            let mut slp = bound_slp();
            let len = slp.read_packet(&mut host).unwrap();
            assert_eq!(slp.payload(len), b"ok", "garbage prefix {:02x?}", garbage);
        }
    }

    #[test]
    fn ignores_misaddressed_packets() {
        let (mut palm, mut host) = pipe::pair();
        // Loopback chatter, then a packet for the wrong port, then ours
        palm.write_all(&frame(port::DLP, port::DLP, packet_type::LOOPBACK, 1, b"loop"))
            .unwrap();
        palm.write_all(&frame(port::CONSOLE, port::DLP, packet_type::PAD, 2, b"nope"))
            .unwrap();
        palm.write_all(&frame(port::DLP, port::DLP, packet_type::PAD, 3, b"mine"))
            .unwrap();
        let mut slp = bound_slp();
        let len = slp.read_packet(&mut host).unwrap();
        assert_eq!(slp.payload(len), b"mine");
        assert_eq!(slp.last_xid(), 3);
    }

    #[test]
    fn drops_frame_with_bad_header_checksum() {
        let (mut palm, mut host) = pipe::pair();
        let mut bad = frame(port::DLP, port::DLP, packet_type::PAD, 1, b"bad");
        bad[SLP_HEADER_LEN - 1] ^= 0xff; // mangle the checksum byte
        palm.write_all(&bad).unwrap();
        palm.write_all(&frame(port::DLP, port::DLP, packet_type::PAD, 2, b"good"))
            .unwrap();
        let mut slp = bound_slp();
        let len = slp.read_packet(&mut host).unwrap();
        assert_eq!(slp.payload(len), b"good");
    }

    #[test]
    fn drops_frame_with_bad_crc() {
        let (mut palm, mut host) = pipe::pair();
        let mut bad = frame(port::DLP, port::DLP, packet_type::PAD, 1, b"bad");
        let last_payload_byte = bad.len() - SLP_CRC_LEN - 1;
        bad[last_payload_byte] ^= 0x01;
        palm.write_all(&bad).unwrap();
        palm.write_all(&frame(port::DLP, port::DLP, packet_type::PAD, 2, b"good"))
            .unwrap();
        let mut slp = bound_slp();
        let len = slp.read_packet(&mut host).unwrap();
        assert_eq!(slp.payload(len), b"good");
        assert_eq!(slp.last_xid(), 2);
    }

    #[test]
    fn input_buffer_grows_and_stays_grown() {
        let (mut palm, mut host) = pipe::pair();
        let mut slp = bound_slp();

        palm.write_all(&frame(port::DLP, port::DLP, packet_type::PAD, 1, &[0xaa; 512]))
            .unwrap();
        slp.read_packet(&mut host).unwrap();

        let big = vec![0xbb; 50_000];
        palm.write_all(&frame(port::DLP, port::DLP, packet_type::PAD, 2, &big))
            .unwrap();
        let len = slp.read_packet(&mut host).unwrap();
        assert_eq!(slp.payload(len), &big[..]);
        assert!(slp.inbuf.len() >= 50_000);

        palm.write_all(&frame(port::DLP, port::DLP, packet_type::PAD, 3, &[0xcc; 1024]))
            .unwrap();
        slp.read_packet(&mut host).unwrap();
        assert!(slp.inbuf.len() >= 50_000);
    }

    #[test]
    fn replies_go_to_the_latched_remote() {
        let (mut palm, mut host) = pipe::pair();
        // The handheld speaks from console port 1 for some reason
        palm.write_all(&frame(port::DLP, port::CONSOLE, packet_type::PAD, 7, b"hi"))
            .unwrap();
        let mut slp = bound_slp();
        slp.read_packet(&mut host).unwrap();
        slp.write_packet(&mut host, b"yo", 7).unwrap();

        // Read the reply back raw and check the addressing
        let mut raw = [0u8; 64];
        let mut got = 0;
        while got < SLP_HEADER_LEN + 2 + SLP_CRC_LEN {
            got += palm.read(&mut raw[got..]).unwrap();
        }
        assert_eq!(raw[3], port::CONSOLE); // dest = latched remote port
        assert_eq!(raw[4], port::DLP); // src = bound port
    }
}
