//! Pulse (waveform) operations.
//!
//! One operation describes 100 ms of output as four 25 ms frequency values
//! followed by four 25 ms strength percentages. On the wire each operation
//! is the 8-byte hex string `ffffffffssssssss`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DgLabError, DgLabResult};

/// Playback time of a single [`PulseOperation`].
pub const SEGMENT_UNIT: Duration = Duration::from_millis(100);

/// Longest pulse list the App accepts in one message (10 seconds).
pub const MAX_PULSES_PER_MESSAGE: usize = 100;

/// A single 100 ms waveform segment.
///
/// Serialized as `[[f, f, f, f], [s, s, s, s]]`, matching the custom pulse
/// data file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "([u8; 4], [u8; 4])", into = "([u8; 4], [u8; 4])")]
pub struct PulseOperation {
    pub frequency: [u8; 4],
    pub strength: [u8; 4],
}

impl PulseOperation {
    pub const fn new(frequency: [u8; 4], strength: [u8; 4]) -> Self {
        Self {
            frequency,
            strength,
        }
    }

    pub fn to_hex(&self) -> String {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self.frequency);
        bytes[4..].copy_from_slice(&self.strength);
        hex::encode(bytes)
    }

    pub fn from_hex(s: &str) -> DgLabResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| DgLabError::InvalidMessage(format!("bad pulse hex {s:?}: {e}")))?;
        if bytes.len() != 8 {
            return Err(DgLabError::InvalidMessage(format!(
                "pulse hex must be 8 bytes, got {}",
                bytes.len()
            )));
        }
        let mut frequency = [0u8; 4];
        let mut strength = [0u8; 4];
        frequency.copy_from_slice(&bytes[..4]);
        strength.copy_from_slice(&bytes[4..]);
        Ok(Self::new(frequency, strength))
    }
}

impl From<([u8; 4], [u8; 4])> for PulseOperation {
    fn from((frequency, strength): ([u8; 4], [u8; 4])) -> Self {
        Self::new(frequency, strength)
    }
}

impl From<PulseOperation> for ([u8; 4], [u8; 4]) {
    fn from(op: PulseOperation) -> Self {
        (op.frequency, op.strength)
    }
}

/// Total playback time of `count` segments.
pub fn playback_duration(count: usize) -> Duration {
    SEGMENT_UNIT * count as u32
}
