//! DG-Lab socket control messages.
//!
//! Every frame on the wire is a JSON object
//! `{"type": ..., "clientId": ..., "targetId": ..., "message": ...}`.
//! The `message` body is either a return code (`"200"`, `"209"`, ...), the
//! literal `targetId` / `DGLAB` handshake markers, or a [`DataMessage`].

use serde::{Deserialize, Serialize};

use crate::error::{DgLabError, DgLabResult};
use crate::pulse::PulseOperation;
use crate::strength::{Channel, FeedbackButton, StrengthData, StrengthOperation};

/// Body of the relay's registration message: `clientId` carries the new id.
pub const REGISTER_MARKER: &str = "targetId";
/// Body of the App's bind request.
pub const BIND_MARKER: &str = "DGLAB";

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Bind,
    Msg,
    Heartbeat,
    Break,
    Error,
}

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub message: String,
}

impl Envelope {
    pub fn new(
        msg_type: MsgType,
        client_id: impl Into<String>,
        target_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            msg_type,
            client_id: client_id.into(),
            target_id: target_id.into(),
            message: message.into(),
        }
    }

    /// Build a frame whose body is a bare return code.
    pub fn with_code(
        msg_type: MsgType,
        client_id: impl Into<String>,
        target_id: impl Into<String>,
        code: RetCode,
    ) -> Self {
        Self::new(msg_type, client_id, target_id, code.code().to_string())
    }

    /// Interpret the body as a return code, if it is one.
    pub fn ret_code(&self) -> Option<RetCode> {
        self.message.parse::<u16>().ok().and_then(RetCode::from_code)
    }
}

/// Return codes used by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetCode {
    Success,
    /// The peer on the other side of the binding went away.
    ClientDisconnected,
    InvalidClientId,
    ServerDelay,
    IdAlreadyBound,
    TargetClientNotFound,
    IncompatibleRelationship,
    NonJsonContent,
    RecipientNotFound,
    MessageTooLong,
    ServerInternalError,
}

impl RetCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::ClientDisconnected => 209,
            Self::InvalidClientId => 210,
            Self::ServerDelay => 211,
            Self::IdAlreadyBound => 400,
            Self::TargetClientNotFound => 401,
            Self::IncompatibleRelationship => 402,
            Self::NonJsonContent => 403,
            Self::RecipientNotFound => 404,
            Self::MessageTooLong => 405,
            Self::ServerInternalError => 500,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Self::Success),
            209 => Some(Self::ClientDisconnected),
            210 => Some(Self::InvalidClientId),
            211 => Some(Self::ServerDelay),
            400 => Some(Self::IdAlreadyBound),
            401 => Some(Self::TargetClientNotFound),
            402 => Some(Self::IncompatibleRelationship),
            403 => Some(Self::NonJsonContent),
            404 => Some(Self::RecipientNotFound),
            405 => Some(Self::MessageTooLong),
            500 => Some(Self::ServerInternalError),
            _ => None,
        }
    }
}

/// Payload of a `msg` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMessage {
    /// App → terminal: `strength-a+b+aLimit+bLimit`.
    Strength(StrengthData),
    /// App → terminal: `feedback-N`.
    Feedback(FeedbackButton),
    /// Terminal → App: `strength-channel+mode+value`.
    SetStrength {
        channel: Channel,
        operation: StrengthOperation,
        value: u8,
    },
    /// Terminal → App: `pulse-A:["0a0a0a0a00000000", ...]`.
    Pulse {
        channel: Channel,
        operations: Vec<PulseOperation>,
    },
    /// Terminal → App: `clear-N`, empties one channel's pulse queue.
    Clear(Channel),
}

impl DataMessage {
    /// Parse a `msg` body.
    pub fn parse(body: &str) -> DgLabResult<Self> {
        if let Some(rest) = body.strip_prefix("strength-") {
            let fields: Vec<&str> = rest.split('+').collect();
            return match fields.as_slice() {
                [a, b, a_limit, b_limit] => Ok(Self::Strength(StrengthData {
                    a: parse_u8(a)?,
                    b: parse_u8(b)?,
                    a_limit: parse_u8(a_limit)?,
                    b_limit: parse_u8(b_limit)?,
                })),
                [channel, mode, value] => Ok(Self::SetStrength {
                    channel: Channel::from_number(parse_u8(channel)?)?,
                    operation: StrengthOperation::from_mode(parse_u8(mode)?)?,
                    value: parse_u8(value)?,
                }),
                _ => Err(DgLabError::InvalidMessage(format!(
                    "malformed strength body: {body}"
                ))),
            };
        }
        if let Some(rest) = body.strip_prefix("feedback-") {
            return Ok(Self::Feedback(FeedbackButton::from_index(parse_u8(rest)?)?));
        }
        if let Some(rest) = body.strip_prefix("clear-") {
            return Ok(Self::Clear(Channel::from_number(parse_u8(rest)?)?));
        }
        if let Some(rest) = body.strip_prefix("pulse-") {
            let (letter, list) = rest.split_once(':').ok_or_else(|| {
                DgLabError::InvalidMessage(format!("malformed pulse body: {body}"))
            })?;
            let channel = Channel::from_letter(letter)?;
            let hex: Vec<String> = serde_json::from_str(list)?;
            let operations = hex
                .iter()
                .map(|h| PulseOperation::from_hex(h))
                .collect::<DgLabResult<Vec<_>>>()?;
            return Ok(Self::Pulse {
                channel,
                operations,
            });
        }
        Err(DgLabError::InvalidMessage(format!("unknown body: {body}")))
    }

    /// Render this payload as a `msg` body.
    pub fn to_body(&self) -> String {
        match self {
            Self::Strength(s) => {
                format!("strength-{}+{}+{}+{}", s.a, s.b, s.a_limit, s.b_limit)
            }
            Self::Feedback(button) => format!("feedback-{}", button.index()),
            Self::SetStrength {
                channel,
                operation,
                value,
            } => format!(
                "strength-{}+{}+{}",
                channel.number(),
                operation.mode(),
                value
            ),
            Self::Pulse {
                channel,
                operations,
            } => {
                let items: Vec<String> = operations
                    .iter()
                    .map(|op| format!("\"{}\"", op.to_hex()))
                    .collect();
                format!("pulse-{}:[{}]", channel.letter(), items.join(","))
            }
            Self::Clear(channel) => format!("clear-{}", channel.number()),
        }
    }
}

fn parse_u8(s: &str) -> DgLabResult<u8> {
    s.trim()
        .parse::<u8>()
        .map_err(|e| DgLabError::InvalidMessage(format!("bad number {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_wire_field_names() {
        let env = Envelope::new(MsgType::Bind, "c1", "t1", BIND_MARKER);
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(
            json,
            r#"{"type":"bind","clientId":"c1","targetId":"t1","message":"DGLAB"}"#
        );
    }

    #[test]
    fn envelope_tolerates_missing_fields() {
        let env: Envelope = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(env.msg_type, MsgType::Heartbeat);
        assert!(env.client_id.is_empty());
    }

    #[test]
    fn ret_code_from_body() {
        let env = Envelope::with_code(MsgType::Break, "c", "t", RetCode::ClientDisconnected);
        assert_eq!(env.message, "209");
        assert_eq!(env.ret_code(), Some(RetCode::ClientDisconnected));
        let env = Envelope::new(MsgType::Bind, "c", "", REGISTER_MARKER);
        assert_eq!(env.ret_code(), None);
    }

    #[test]
    fn parse_strength_report() {
        let msg = DataMessage::parse("strength-11+7+100+35").unwrap();
        assert_eq!(
            msg,
            DataMessage::Strength(StrengthData {
                a: 11,
                b: 7,
                a_limit: 100,
                b_limit: 35,
            })
        );
    }

    #[test]
    fn parse_strength_command() {
        let msg = DataMessage::parse("strength-2+1+20").unwrap();
        assert_eq!(
            msg,
            DataMessage::SetStrength {
                channel: Channel::B,
                operation: StrengthOperation::Increase,
                value: 20,
            }
        );
        assert_eq!(msg.to_body(), "strength-2+1+20");
    }

    #[test]
    fn parse_feedback() {
        assert_eq!(
            DataMessage::parse("feedback-6").unwrap(),
            DataMessage::Feedback(FeedbackButton::from_index(6).unwrap())
        );
        assert!(DataMessage::parse("feedback-12").is_err());
    }

    #[test]
    fn pulse_body_format() {
        let op = PulseOperation::new([10, 10, 10, 10], [0, 5, 10, 20]);
        let msg = DataMessage::Pulse {
            channel: Channel::A,
            operations: vec![op, op],
        };
        let body = msg.to_body();
        assert_eq!(body, r#"pulse-A:["0a0a0a0a00050a14","0a0a0a0a00050a14"]"#);
        assert_eq!(DataMessage::parse(&body).unwrap(), msg);
    }

    #[test]
    fn clear_body() {
        assert_eq!(DataMessage::Clear(Channel::B).to_body(), "clear-2");
    }

    #[test]
    fn unknown_body_rejected() {
        assert!(DataMessage::parse("hello").is_err());
        assert!(DataMessage::parse("strength-1+2").is_err());
    }
}
