use crate::dlp::DlpStatus;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// An error surfaced to the caller.
///
/// Framing-level garbage (a bad SLP preamble, header checksum or CRC) never
/// appears here: the reader silently drops the damaged packet and resumes.
/// Everything that does appear is either fatal for the connection (I/O
/// errors, EOF, terminal timeouts, an abort from the device) or a per-call
/// failure the caller can react to (a protocol violation or a nonzero DLP
/// status).
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The transport reported a clean end of stream mid-session.
    #[error("end of stream from the device")]
    Eof,
    /// A single bounded wait for data elapsed. Recoverable: the DLP layer
    /// re-sends the request a few times before giving up.
    #[error("no data from the device within the read timeout")]
    ReadTimeout,
    /// The retry limit was exhausted. The connection is lost.
    #[error("retry limit exceeded waiting for the device")]
    Timeout,
    /// The device sent a PADP ABORT packet.
    #[error("sync aborted by the device")]
    Aborted,
    #[error("connection is not up")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The request was delivered and rejected by the device.
    #[error("device returned DLP status: {0}")]
    Dlp(DlpStatus),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Eof => ErrorKind::Eof,
            Error::ReadTimeout => ErrorKind::ReadTimeout,
            Error::Timeout => ErrorKind::Timeout,
            Error::Aborted => ErrorKind::Aborted,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Dlp(_) => ErrorKind::Dlp,
        }
    }

    /// True if this error takes the whole connection down with it.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Eof | Error::Timeout | Error::Aborted
        )
    }
}

/// Coarse classification of an [`Error`], retained on the `Connection` as
/// its last-error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Eof,
    ReadTimeout,
    Timeout,
    Aborted,
    NotConnected,
    Protocol,
    Dlp,
}

/// The peer said something the protocol does not allow.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected PADP fragment type {0:#04x}")]
    BadFragmentType(u8),
    #[error("bad flags {0:#04x} on the first fragment of a message")]
    BadFragmentFlags(u8),
    #[error("PADP fragment at offset {got}, expected {expected}")]
    BadOffset { expected: u16, got: u16 },
    #[error("fragment data overruns the announced message length")]
    FragmentOverrun,
    #[error("ACK carries xid {got:#04x}, expected {expected:#04x}")]
    AckXid { expected: u8, got: u8 },
    #[error("message of {0} bytes does not fit in a PADP transaction")]
    MessageTooLong(usize),
    #[error("expected a DLP response, got id {0:#04x}")]
    NotAResponse(u8),
    #[error("DLP response id {got:#04x} does not answer request {expected:#04x}")]
    ResponseId { expected: u8, got: u8 },
    #[error("DLP response argument {0:#06x} missing")]
    MissingArg(u16),
    #[error("truncated message")]
    Truncated,
}
