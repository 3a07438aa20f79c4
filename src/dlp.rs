/*! DLP, the Desktop Link Protocol.

The RPC layer of a HotSync session: one request goes down, one response
comes back, and each carries a list of self-describing arguments. An
argument's header comes in three shapes — tiny (one-byte size), small
(two-byte size) and long (four-byte size) — picked by the sender as the
smallest that fits, and told apart by the top two bits of the header's
first byte: `00`/`01` tiny, `10` small, `11` long.

A response answers a request by carrying the request id with the high
bit set. Response argument data is *borrowed* from the framing layer's
inbound buffer; it stays valid until the next call on the connection.

This module is the codec only. The typed wrappers people actually call
live in [`crate::dlp_cmd`].
*/

use crate::error::{ProtocolError, Result};
use crate::util::ensure_remaining;
use bytes::{Buf, BufMut};
use std::fmt;
use tracing::{trace, warn};

pub(crate) const DLP_REQ_HEADER_LEN: usize = 2;
pub(crate) const DLP_RESP_HEADER_LEN: usize = 4;
const DLP_TINYARG_MAXLEN: usize = 0xff;
const DLP_SMALLARG_MAXLEN: usize = 0xffff;
/// How many times a request is re-sent when the lower layer times out
/// waiting for the response. Works around serial drivers that silently
/// drop inbound data.
pub(crate) const DLP_MAX_TRIES: u32 = 5;

/// One DLP argument: an id and its payload.
#[derive(Debug, Clone, Copy)]
pub struct DlpArg<'a> {
    pub id: u16,
    pub data: &'a [u8],
}

/// A parsed DLP response. The argument data borrows from the
/// connection's inbound buffer and is only valid until the next call.
#[derive(Debug)]
pub struct DlpResponse<'a> {
    pub status: DlpStatus,
    pub args: Vec<DlpArg<'a>>,
}

impl<'a> DlpResponse<'a> {
    /// The argument with the given id, if the device sent one.
    pub fn arg(&self, id: u16) -> Option<DlpArg<'a>> {
        self.args.iter().find(|a| a.id == id).copied()
    }

    /// Turn a nonzero status into an error.
    pub fn checked(self) -> Result<DlpResponse<'a>> {
        if self.status == DlpStatus::NoError {
            Ok(self)
        } else {
            Err(crate::error::Error::Dlp(self.status))
        }
    }
}

fn encoded_len(args: &[DlpArg]) -> usize {
    let mut len = DLP_REQ_HEADER_LEN;
    for arg in args {
        len += match arg.data.len() {
            n if n <= DLP_TINYARG_MAXLEN => 2 + n,
            n if n <= DLP_SMALLARG_MAXLEN => 4 + n,
            n => 6 + n,
        };
    }
    len
}

/// Encode a request into a single exact-size buffer, ready to hand to
/// the framing layer as one unit.
pub(crate) fn encode_request(id: u8, args: &[DlpArg]) -> Vec<u8> {
    debug_assert!(args.len() <= u8::MAX as usize);
    let total = encoded_len(args);
    let mut out = Vec::with_capacity(total);
    out.put_u8(id);
    out.put_u8(args.len() as u8);
    for arg in args {
        match arg.data.len() {
            n if n <= DLP_TINYARG_MAXLEN => {
                out.put_u8((arg.id as u8) & 0x3f);
                out.put_u8(n as u8);
            }
            n if n <= DLP_SMALLARG_MAXLEN => {
                out.put_u8((arg.id as u8) & 0x3f | 0x80);
                out.put_u8(0); // padding
                out.put_u16(n as u16);
            }
            n => {
                out.put_u16(arg.id & 0x3fff | 0xc000);
                out.put_u32(n as u32);
            }
        }
        out.extend_from_slice(arg.data);
    }
    debug_assert_eq!(out.len(), total);
    trace!("DLP request {:#04x}, {} args, {} bytes", id, args.len(), total);
    out
}

/// Parse the response to request `req_id`, borrowing argument data from
/// `buf`.
pub(crate) fn parse_response(req_id: u8, mut buf: &[u8]) -> Result<DlpResponse<'_>> {
    ensure_remaining!(buf, DLP_RESP_HEADER_LEN);
    let id = buf.get_u8();
    let argc = buf.get_u8();
    let status = DlpStatus::from(buf.get_u16());
    if id & 0x80 == 0 {
        return Err(ProtocolError::NotAResponse(id).into());
    }
    if id & 0x7f != req_id {
        return Err(ProtocolError::ResponseId {
            expected: req_id,
            got: id,
        }
        .into());
    }
    trace!(
        "DLP response {:#04x}, {} args, status {:?}",
        id,
        argc,
        status
    );

    let mut args = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        ensure_remaining!(buf, 1);
        let (id, size) = match buf[0] & 0xc0 {
            0xc0 => {
                // Long
                ensure_remaining!(buf, 6);
                (buf.get_u16() & 0x3fff, buf.get_u32() as usize)
            }
            0x80 => {
                // Small
                ensure_remaining!(buf, 4);
                let id = u16::from(buf.get_u8() & 0x3f);
                buf.get_u8(); // padding
                (id, buf.get_u16() as usize)
            }
            _ => {
                // Tiny
                ensure_remaining!(buf, 2);
                (u16::from(buf.get_u8() & 0x3f), buf.get_u8() as usize)
            }
        };
        ensure_remaining!(buf, size);
        let data = &buf[..size];
        buf.advance(size);
        args.push(DlpArg { id, data });
    }
    if !buf.is_empty() {
        warn!("{} trailing bytes after the last DLP argument", buf.len());
    }
    Ok(DlpResponse { status, args })
}

/// The status word of a DLP response. Zero means the request succeeded;
/// anything else is the device rejecting it, with these fixed codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlpStatus {
    NoError,
    /// General system error on the device.
    System,
    /// Unknown request id.
    IllegalRequest,
    OutOfMemory,
    InvalidParameter,
    /// Database, record or resource not found.
    NotFound,
    /// No databases are open.
    NoneOpen,
    /// Database is open by someone else.
    DatabaseOpen,
    TooManyOpen,
    AlreadyExists,
    CantOpen,
    RecordDeleted,
    RecordBusy,
    /// Operation not supported on this database type.
    Unsupported,
    ReadOnly,
    NoSpace,
    LimitExceeded,
    SyncCancelled,
    /// Malformed argument wrapper.
    BadWrapper,
    /// A required argument was missing.
    MissingArgument,
    BadArgumentSize,
    Unknown(u16),
}

impl From<u16> for DlpStatus {
    fn from(code: u16) -> Self {
        match code {
            0x00 => DlpStatus::NoError,
            0x01 => DlpStatus::System,
            0x02 => DlpStatus::IllegalRequest,
            0x03 => DlpStatus::OutOfMemory,
            0x04 => DlpStatus::InvalidParameter,
            0x05 => DlpStatus::NotFound,
            0x06 => DlpStatus::NoneOpen,
            0x07 => DlpStatus::DatabaseOpen,
            0x08 => DlpStatus::TooManyOpen,
            0x09 => DlpStatus::AlreadyExists,
            0x0a => DlpStatus::CantOpen,
            0x0b => DlpStatus::RecordDeleted,
            0x0c => DlpStatus::RecordBusy,
            0x0d => DlpStatus::Unsupported,
            0x0f => DlpStatus::ReadOnly,
            0x10 => DlpStatus::NoSpace,
            0x11 => DlpStatus::LimitExceeded,
            0x12 => DlpStatus::SyncCancelled,
            0x13 => DlpStatus::BadWrapper,
            0x14 => DlpStatus::MissingArgument,
            0x15 => DlpStatus::BadArgumentSize,
            n => DlpStatus::Unknown(n),
        }
    }
}

impl DlpStatus {
    pub fn code(self) -> u16 {
        match self {
            DlpStatus::NoError => 0x00,
            DlpStatus::System => 0x01,
            DlpStatus::IllegalRequest => 0x02,
            DlpStatus::OutOfMemory => 0x03,
            DlpStatus::InvalidParameter => 0x04,
            DlpStatus::NotFound => 0x05,
            DlpStatus::NoneOpen => 0x06,
            DlpStatus::DatabaseOpen => 0x07,
            DlpStatus::TooManyOpen => 0x08,
            DlpStatus::AlreadyExists => 0x09,
            DlpStatus::CantOpen => 0x0a,
            DlpStatus::RecordDeleted => 0x0b,
            DlpStatus::RecordBusy => 0x0c,
            DlpStatus::Unsupported => 0x0d,
            DlpStatus::ReadOnly => 0x0f,
            DlpStatus::NoSpace => 0x10,
            DlpStatus::LimitExceeded => 0x11,
            DlpStatus::SyncCancelled => 0x12,
            DlpStatus::BadWrapper => 0x13,
            DlpStatus::MissingArgument => 0x14,
            DlpStatus::BadArgumentSize => 0x15,
            DlpStatus::Unknown(n) => n,
        }
    }
}

impl fmt::Display for DlpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#04x})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    /// Encode a request, reinterpret it as a response to itself (flip
    /// the high bit, splice in a status word), and parse it back.
    fn as_response(req: &[u8]) -> Vec<u8> {
        let mut resp = Vec::new();
        resp.put_u8(req[0] | 0x80);
        resp.put_u8(req[1]);
        resp.put_u16(0); // status
        resp.extend_from_slice(&req[2..]);
        resp
    }

    #[test]
    fn argument_shapes_round_trip() {
        for size in [0usize, 1, 255, 256, 65_535, 65_536, 10_000_000] {
            let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let req = encode_request(0x13, &[DlpArg { id: 0x20, data: &data }]);

            // The sender must pick the smallest shape that fits
            let header_len = match size {
                n if n <= 0xff => 2,
                n if n <= 0xffff => 4,
                _ => 6,
            };
            assert_eq!(req.len(), 2 + header_len + size, "size {}", size);

            let resp = as_response(&req);
            let parsed = parse_response(0x13, &resp).unwrap();
            assert_eq!(parsed.status, DlpStatus::NoError);
            assert_eq!(parsed.args.len(), 1);
            assert_eq!(parsed.args[0].id, 0x20);
            assert_eq!(parsed.args[0].data, &data[..]);
        }
    }

    #[test]
    fn multiple_arguments_parse_in_order() {
        let big = vec![0xab; 300];
        let req = encode_request(
            0x11,
            &[
                DlpArg { id: 0x20, data: b"tiny" },
                DlpArg { id: 0x21, data: &big },
            ],
        );
        let resp = as_response(&req);
        let parsed = parse_response(0x11, &resp).unwrap();
        assert_eq!(parsed.args.len(), 2);
        assert_eq!(parsed.args[0].data, b"tiny");
        assert_eq!(parsed.arg(0x21).unwrap().data, &big[..]);
    }

    #[test]
    fn response_must_have_the_high_bit_set() {
        let buf = [0x13u8, 0x00, 0x00, 0x00];
        let err = parse_response(0x13, &buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::NotAResponse(0x13))
        ));
    }

    #[test]
    fn response_id_must_match_the_request() {
        let buf = [0x94u8, 0x00, 0x00, 0x00];
        let err = parse_response(0x13, &buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ResponseId { expected: 0x13, got: 0x94 })
        ));
    }

    #[test]
    fn nonzero_status_is_carried_through() {
        let buf = [0x97u8, 0x00, 0x00, 0x05];
        let parsed = parse_response(0x17, &buf).unwrap();
        assert_eq!(parsed.status, DlpStatus::NotFound);
        assert!(matches!(
            parsed.checked().unwrap_err(),
            Error::Dlp(DlpStatus::NotFound)
        ));
    }

    #[test]
    fn truncated_arguments_are_rejected() {
        // Header promises one tiny arg of 10 bytes, delivers 3
        let buf = [0x93u8, 0x01, 0x00, 0x00, 0x20, 0x0a, 0x01, 0x02, 0x03];
        let err = parse_response(0x13, &buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn status_codes_round_trip() {
        for code in 0u16..=0x20 {
            assert_eq!(DlpStatus::from(code).code(), code);
        }
    }
}
