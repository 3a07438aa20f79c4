macro_rules! ensure_remaining {
    ($buf:expr, $len:expr) => {
        if bytes::Buf::remaining(&$buf) < $len {
            return Err(crate::error::ProtocolError::Truncated.into());
        }
    };
}
pub(crate) use ensure_remaining;

/// Grow `buf` so that at least `len` bytes are addressable. Buffers only
/// ever grow: a large packet leaves its mark, and later smaller packets
/// reuse the space.
pub(crate) fn grow_to(buf: &mut Vec<u8>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0);
    }
}
