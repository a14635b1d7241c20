//! Length-prefixed wire framing.
//!
//! A frame is a 4-byte little-endian payload length followed by that
//! many payload bytes. A zero-length payload is legal and decodes to an
//! empty frame. The blocking helpers here are the client-side surface;
//! servers echo raw bytes and never parse frames.

use bytes::{BufMut, BytesMut};
use std::io::{self, Read, Write};

/// Frame header size in bytes.
pub const HEADER_LEN: usize = 4;

/// Encode a payload into a framed byte buffer.
pub fn encode(payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
    out
}

/// Write one frame: length first, then the body.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds u32 length"))?;
    writer.write_all(&len.to_le_bytes())?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    writer.flush()
}

/// Read one frame: length, then exactly that many payload bytes.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload)?;
    }
    Ok(payload)
}
