//! Framing: length-prefix (4 bytes BE) + JSON payload. Used for control envelopes and the
//! data-channel metadata block.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::Envelope;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB

/// Encode any JSON-serializable value into a single frame.
pub fn encode_json_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = serde_json::to_vec(value)?;
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Encode an envelope into a single frame: 4 bytes BE length + JSON payload.
pub fn encode_frame(msg: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    encode_json_frame(msg)
}

/// Error encoding a frame (JSON or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Read the payload length from a 4-byte prefix. Rejects lengths over `MAX_FRAME_LEN`.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Parse a frame payload (without the length prefix).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Decode one envelope from the front of `bytes`. Returns the envelope and the number of bytes
/// consumed. Call with a partial buffer; `NeedMore` means try again after more data arrives.
/// A complete frame that is not a valid envelope yields `Decode` carrying its length so the
/// caller can skip it.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let consumed = LEN_SIZE + len;
    let msg = decode_payload(&bytes[LEN_SIZE..consumed])
        .map_err(|source| FrameDecodeError::Decode { consumed, source })?;
    Ok((msg, consumed))
}

/// Error decoding a frame (need more bytes, too large, or a payload that is not an envelope).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {source}")]
    Decode {
        consumed: usize,
        #[source]
        source: serde_json::Error,
    },
}
