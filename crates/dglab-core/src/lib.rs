//! dglab-core: Shared protocol library for DG-Lab socket terminals.
//!
//! Provides the JSON envelope types and payload grammar spoken between a
//! terminal, the relay and the DG-Lab App, the pulse (waveform) codec, and
//! the abstract [`DeviceLink`] seam that sessions drive.

pub mod codec;
pub mod error;
pub mod link;
pub mod messages;
pub mod pulse;
pub mod strength;

// Re-export commonly used items at crate root.
pub use codec::{decode_envelope, encode_envelope, MAX_MESSAGE_LEN};
pub use error::{DgLabError, DgLabResult};
pub use link::{pairing_uri, DeviceLink, LinkEvent};
pub use messages::{DataMessage, Envelope, MsgType, RetCode};
pub use pulse::{PulseOperation, MAX_PULSES_PER_MESSAGE, SEGMENT_UNIT};
pub use strength::{Channel, FeedbackButton, StrengthData, StrengthOperation};
