//! Length-prefixed bincode framing: `[u32 BE length][bincode(Envelope)]`.

use serde::{Deserialize, Serialize};

use crate::messages::Message;

/// Upper bound for one encoded envelope.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub req_id: u64,
    pub message: Message,
}

impl Envelope {
    pub fn new(req_id: u64, message: Message) -> Self {
        Self { req_id, message }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
    #[error("malformed frame body: {0}")]
    Malformed(#[from] bincode::Error),
}

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reads the body length from a frame header, rejecting oversized frames before any allocation.
pub fn frame_body_len(header: [u8; FRAME_HEADER_LEN]) -> Result<usize, FrameError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

pub fn decode_body(body: &[u8]) -> Result<Envelope, FrameError> {
    Ok(bincode::deserialize(body)?)
}
