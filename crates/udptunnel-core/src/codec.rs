//! Wire framing for stream transports.
//!
//! A packet is `[length: u16 BE][id: u32 BE][payload: length bytes]`, with no
//! padding and no checksum. Stream transports have no message boundaries, so
//! every relayed message is wrapped in one packet.
//!
//! [`decode`] never consumes a partial packet: when the buffer does not yet
//! hold a complete packet it returns `None` and the caller keeps accumulating.
//! [`PacketCodec`] applies the same rule over a per-connection `BytesMut`, so a
//! header or payload split across socket reads is reassembled.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::Message;

/// Length of the `[length][id]` packet header.
pub const HEADER_LEN: usize = 6;

/// Largest payload that fits in a packet.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Payload of {0} bytes exceeds the {MAX_PAYLOAD} byte packet limit")]
    OversizedPayload(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for std::io::Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => e,
            other => Self::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

/// Encode a single packet.
pub fn encode(id: u32, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u16::try_from(payload.len()).map_err(|_| CodecError::OversizedPayload(payload.len()))?;

    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Decode one packet from the front of `buffer`.
///
/// Returns `(id, payload, remainder)` where `remainder` is everything after
/// the decoded packet, or `None` if `buffer` does not yet contain a complete
/// packet. Nothing is consumed in the `None` case.
pub fn decode(buffer: &[u8]) -> Option<(u32, &[u8], &[u8])> {
    let (len, id) = header(buffer)?;
    let end = HEADER_LEN + len;
    if buffer.len() < end {
        return None;
    }
    Some((id, &buffer[HEADER_LEN..end], &buffer[end..]))
}

fn header(buffer: &[u8]) -> Option<(usize, u32)> {
    let len = u16::from_be_bytes(buffer.get(0..2)?.try_into().ok()?);
    let id = u32::from_be_bytes(buffer.get(2..HEADER_LEN)?.try_into().ok()?);
    Some((usize::from(len), id))
}

/// `tokio_util` codec for framed packet streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let Some((len, id)) = header(src) else {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        };

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).to_vec();
        Ok(Some(Message::new(id, payload)))
    }
}

impl Encoder<Message> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = u16::try_from(msg.payload.len())
            .map_err(|_| CodecError::OversizedPayload(msg.payload.len()))?;

        dst.reserve(HEADER_LEN + msg.payload.len());
        dst.put_u16(len);
        dst.put_u32(msg.id);
        dst.extend_from_slice(&msg.payload);
        Ok(())
    }
}
