//! JSON framing for the DG-Lab socket.
//!
//! Each WebSocket text frame carries exactly one [`Envelope`]. The relay
//! refuses bodies longer than [`MAX_MESSAGE_LEN`] characters.

use crate::error::{DgLabError, DgLabResult};
use crate::messages::{Envelope, RetCode};

/// Longest `message` body the relay forwards.
pub const MAX_MESSAGE_LEN: usize = 1950;

/// Encode an envelope into a text frame.
pub fn encode_envelope(envelope: &Envelope) -> DgLabResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a text frame into an envelope.
pub fn decode_envelope(frame: &str) -> DgLabResult<Envelope> {
    Ok(serde_json::from_str(frame)?)
}

/// Reject bodies the relay would answer with `405`.
pub fn check_message_len(envelope: &Envelope) -> DgLabResult<()> {
    if envelope.message.chars().count() > MAX_MESSAGE_LEN {
        return Err(DgLabError::Protocol(RetCode::MessageTooLong));
    }
    Ok(())
}
