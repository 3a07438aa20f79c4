/*! NetSync framing and the session-opening ritual.

Devices that negotiate NetSync (TCP sync, and the USB M50x class)
replace SLP and PADP with a much simpler framing: a command byte, a
transaction id, a 4-byte big-endian length, then the payload. There is
no CRC, no fragmentation and no ACK; the byte stream underneath is
assumed reliable.

Before the first DLP exchange the two ends trade a fixed sequence of
"ritual" packets. Their contents look like a capability exchange but
their semantics don't matter for interoperability: what matters is that
the statements we send are byte-for-byte the ones a device expects.
The device speaks first; we answer with statement 2, it replies, we send
statement 3, and its final reply ends the ritual.
*/

use crate::error::{Error, Result};
use crate::transport::{self, Direction, Transport, Wait};
use crate::util::grow_to;
use bytes::{Buf, BufMut};
use std::time::Duration;
use tracing::{debug, trace};

const NETSYNC_HEADER_LEN: usize = 6;
const NETSYNC_INIT_INBUF_LEN: usize = 1024;
/// Every data frame carries this command byte.
const NETSYNC_CMD: u8 = 0x01;
/// Leading uword of a wakeup datagram. Anything else is not a wakeup.
pub(crate) const NETSYNC_WAKEUP_MAGIC: u16 = 0xfade;
/// Default wait for the next inbound frame.
const NETSYNC_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The device's opening ritual statement. Under the USB M50x stack it
/// arrives raw, without a frame header, so its length is fixed here.
pub(crate) const RITUAL_STMT1_LEN: usize = 22;

/// Ritual statement 2, sent by us after the device's opening statement.
static RITUAL_STMT2: [u8; 50] = [
    0x12, // Command
    0x01, // argc
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x20, // Arg ID
    0x00, 0x00, 0x00, 0x24, // Arg length
    // Arg data
    0xff, 0xff, 0xff, 0xff, //
    0x3c, 0x00, // These are reversed in the response
    0x3c, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0xc0, 0xa8, 0xa5, 0x1f, // 192.168.165.31
    0x04, 0x27, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
];

/// Ritual statement 3, the last thing we say before DLP traffic starts.
static RITUAL_STMT3: [u8; 46] = [
    0x13, // Command
    0x01, // argc
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x20, // Arg ID
    0x00, 0x00, 0x00, 0x20, // Arg length
    // Arg data; very similar to statement 2's
    0xff, 0xff, 0xff, 0xff, //
    0x00, 0x3c, //
    0x00, 0x3c, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x01, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
];

/// The UDP datagram a handheld broadcasts to start a TCP sync, and the
/// acknowledgment we send back.
///
/// Nobody knows what the `unknown` byte means; it is carried back in the
/// ack untouched and never inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wakeup {
    /// 1 = wakeup, 2 = acknowledgment.
    pub kind: u8,
    pub unknown: u8,
    pub hostid: u32,
    pub netmask: u32,
    /// NUL-terminated hostname bytes, exactly as received.
    pub hostname: Vec<u8>,
}

pub(crate) const WAKEUP_KIND_ACK: u8 = 2;

impl Wakeup {
    /// Parse a datagram. `None` if it is too short or the magic doesn't
    /// match — such datagrams are simply not wakeup packets.
    pub fn parse(buf: &[u8]) -> Option<Wakeup> {
        if buf.len() < 12 {
            return None;
        }
        let mut b = buf;
        if b.get_u16() != NETSYNC_WAKEUP_MAGIC {
            return None;
        }
        Some(Wakeup {
            kind: b.get_u8(),
            unknown: b.get_u8(),
            hostid: b.get_u32(),
            netmask: b.get_u32(),
            hostname: b.to_vec(),
        })
    }

    /// The acknowledgment for this wakeup: type 2, everything else
    /// preserved verbatim.
    pub fn ack(&self) -> Wakeup {
        Wakeup {
            kind: WAKEUP_KIND_ACK,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.hostname.len());
        out.put_u16(NETSYNC_WAKEUP_MAGIC);
        out.put_u8(self.kind);
        out.put_u8(self.unknown);
        out.put_u32(self.hostid);
        out.put_u32(self.netmask);
        out.extend_from_slice(&self.hostname);
        out
    }
}

/// The length-prefixed framer that stands in for SLP+PADP on NetSync
/// capable devices.
pub struct NetSync {
    /// Bumped before every outbound frame; the first frame carries 1.
    xid: u8,
    read_timeout: Duration,
    inbuf: Vec<u8>,
}

impl NetSync {
    pub fn new() -> NetSync {
        NetSync {
            xid: 0,
            read_timeout: NETSYNC_READ_TIMEOUT,
            inbuf: vec![0; NETSYNC_INIT_INBUF_LEN],
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    fn bump_xid(&mut self) {
        self.xid = self.xid.wrapping_add(1);
        if self.xid == 0xff || self.xid == 0x00 {
            self.xid = 0x01;
        }
    }

    /// Read one frame; returns the payload length, with the bytes in
    /// [`NetSync::message`].
    pub fn read(&mut self, io: &mut dyn Transport) -> Result<usize> {
        if io.wait(Direction::Read, self.read_timeout)? == Wait::TimedOut {
            return Err(Error::ReadTimeout);
        }
        let mut header = [0u8; NETSYNC_HEADER_LEN];
        transport::read_exact(io, &mut header)?;
        let mut h = &header[..];
        let cmd = h.get_u8();
        let xid = h.get_u8();
        let len = h.get_u32() as usize;
        trace!("netsync frame: cmd {:#04x}, xid {:#04x}, {} bytes", cmd, xid, len);
        grow_to(&mut self.inbuf, len);
        transport::read_exact(io, &mut self.inbuf[..len])?;
        Ok(len)
    }

    /// The payload of the frame most recently returned by
    /// [`NetSync::read`].
    pub fn message(&self, len: usize) -> &[u8] {
        &self.inbuf[..len]
    }

    pub fn write(&mut self, io: &mut dyn Transport, buf: &[u8]) -> Result<()> {
        self.bump_xid();
        trace!("netsync write: xid {:#04x}, {} bytes", self.xid, buf.len());
        let mut out = Vec::with_capacity(NETSYNC_HEADER_LEN + buf.len());
        out.put_u8(NETSYNC_CMD);
        out.put_u8(self.xid);
        out.put_u32(buf.len() as u32);
        out.extend_from_slice(buf);
        io.write_all(&out)?;
        Ok(())
    }

    /// Run the opening ritual. With `first_raw` (the USB M50x stack) the
    /// device's opening statement arrives without a frame header; over
    /// TCP everything is framed.
    pub fn ritual(&mut self, io: &mut dyn Transport, first_raw: bool) -> Result<()> {
        if first_raw {
            let mut stmt1 = [0u8; RITUAL_STMT1_LEN];
            transport::read_exact(io, &mut stmt1)?;
            trace!("ritual statement 1, raw: {:02x?}", stmt1);
        } else {
            self.read(io)?;
        }
        self.write(io, &RITUAL_STMT2)?;
        self.read(io)?;
        self.write(io, &RITUAL_STMT3)?;
        self.read(io)?;
        debug!("ritual complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe;

    #[test]
    fn frames_round_trip_and_xids_count_up_from_one() {
        let (mut a, mut b) = pipe::pair();
        let mut tx = NetSync::new();
        let mut rx = NetSync::new();
        for expected_xid in 1..=3u8 {
            let payload = vec![expected_xid; 10];
            tx.write(&mut a, &payload).unwrap();

            // Check the raw header on the way past
            let mut raw = vec![0u8; NETSYNC_HEADER_LEN + payload.len()];
            transport::read_exact(&mut b, &mut raw).unwrap();
            assert_eq!(raw[0], NETSYNC_CMD);
            assert_eq!(raw[1], expected_xid);
            b.write_all(&raw).unwrap();

            let len = rx.read(&mut a).unwrap();
            assert_eq!(rx.message(len), &payload[..]);
        }
    }

    #[test]
    fn read_times_out_when_idle() {
        let (mut a, _b) = pipe::pair();
        let mut ns = NetSync::new();
        ns.set_read_timeout(Duration::from_millis(20));
        let err = ns.read(&mut a).unwrap_err();
        assert!(matches!(err, Error::ReadTimeout));
    }

    #[test]
    fn wakeup_parse_and_ack_preserve_fields() {
        let mut pkt = Vec::new();
        pkt.put_u16(NETSYNC_WAKEUP_MAGIC);
        pkt.put_u8(1); // wakeup
        pkt.put_u8(0x77); // the mystery byte
        pkt.put_u32(0xc0a8_0102); // hostid
        pkt.put_u32(0xffff_ff00); // netmask
        pkt.extend_from_slice(b"palm\0");

        let wakeup = Wakeup::parse(&pkt).unwrap();
        assert_eq!(wakeup.kind, 1);
        assert_eq!(wakeup.unknown, 0x77);
        assert_eq!(wakeup.hostname, b"palm\0");

        let ack = wakeup.ack();
        assert_eq!(ack.kind, WAKEUP_KIND_ACK);
        assert_eq!(ack.unknown, 0x77);
        assert_eq!(ack.hostid, 0xc0a8_0102);
        assert_eq!(ack.netmask, 0xffff_ff00);
        assert_eq!(ack.hostname, b"palm\0");
        // Ack differs from the original only in the type byte
        let mut expected = pkt.clone();
        expected[2] = WAKEUP_KIND_ACK;
        assert_eq!(ack.encode(), expected);
    }

    #[test]
    fn non_wakeup_datagrams_are_rejected() {
        assert_eq!(Wakeup::parse(b"\x12\x34\x01\x00aaaaaaaa"), None);
        assert_eq!(Wakeup::parse(b"\xfa\xde\x01"), None);
    }

    #[test]
    fn framed_ritual_exchange() {
        let (host_io, mut dev_io) = pipe::pair();
        let host = std::thread::spawn(move || {
            let mut io = host_io;
            let mut ns = NetSync::new();
            ns.ritual(&mut io, false).unwrap();
            ns
        });

        // Play the device side by hand
        let mut dev = NetSync::new();
        dev.write(&mut dev_io, &[0x90, 0x01, 0, 0, 0, 0]).unwrap(); // statement 1
        let len = dev.read(&mut dev_io).unwrap();
        assert_eq!(dev.message(len), &RITUAL_STMT2[..]);
        dev.write(&mut dev_io, &[0x92, 0x01]).unwrap(); // reply 2
        let len = dev.read(&mut dev_io).unwrap();
        assert_eq!(dev.message(len), &RITUAL_STMT3[..]);
        dev.write(&mut dev_io, &[0x93, 0x00]).unwrap(); // reply 3

        let ns = host.join().unwrap();
        // Two statements sent: the next frame will carry xid 3
        assert_eq!(ns.xid, 2);
    }

    #[test]
    fn raw_first_statement_ritual() {
        let (host_io, mut dev_io) = pipe::pair();
        let host = std::thread::spawn(move || {
            let mut io = host_io;
            let mut ns = NetSync::new();
            ns.ritual(&mut io, true).unwrap();
        });

        // Statement 1 goes over the wire bare, no frame header
        dev_io.write_all(&[0x90; RITUAL_STMT1_LEN]).unwrap();
        let mut dev = NetSync::new();
        let len = dev.read(&mut dev_io).unwrap();
        assert_eq!(dev.message(len), &RITUAL_STMT2[..]);
        dev.write(&mut dev_io, &[0x92, 0x01]).unwrap();
        let len = dev.read(&mut dev_io).unwrap();
        assert_eq!(dev.message(len), &RITUAL_STMT3[..]);
        dev.write(&mut dev_io, &[0x93, 0x00]).unwrap();

        host.join().unwrap();
    }
}
