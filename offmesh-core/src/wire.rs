//! Datagram framing for discovery: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
/// A frame must fit a single UDP datagram.
const MAX_FRAME_LEN: u32 = 64 * 1024 - LEN_SIZE as u32;

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// A datagram shorter than its declared length yields `Truncated`.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let Some(prefix) = bytes.get(..LEN_SIZE) else {
        return Err(FrameDecodeError::Truncated);
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let end = LEN_SIZE + len as usize;
    let body = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::Truncated)?;
    let msg: Message = bincode::deserialize(body)?;
    Ok((msg, end))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("truncated frame")]
    Truncated,
    #[error("frame too large ({0} bytes)")]
    TooLarge(u32),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
