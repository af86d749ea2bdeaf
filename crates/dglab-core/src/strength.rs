//! Channel, strength and feedback types.

use serde::{Deserialize, Serialize};

use crate::error::{DgLabError, DgLabResult};

/// Output channel of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub const BOTH: [Channel; 2] = [Channel::A, Channel::B];

    /// Numeric form used by `strength-` and `clear-` bodies.
    pub fn number(self) -> u8 {
        match self {
            Self::A => 1,
            Self::B => 2,
        }
    }

    pub fn from_number(n: u8) -> DgLabResult<Self> {
        match n {
            1 => Ok(Self::A),
            2 => Ok(Self::B),
            _ => Err(DgLabError::InvalidMessage(format!("unknown channel {n}"))),
        }
    }

    /// Letter form used by `pulse-` bodies.
    pub fn letter(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    pub fn from_letter(s: &str) -> DgLabResult<Self> {
        match s {
            "A" | "a" => Ok(Self::A),
            "B" | "b" => Ok(Self::B),
            _ => Err(DgLabError::InvalidMessage(format!("unknown channel {s:?}"))),
        }
    }
}

/// How a `strength-` command changes the channel strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrengthOperation {
    Decrease,
    Increase,
    Set,
}

impl StrengthOperation {
    pub fn mode(self) -> u8 {
        match self {
            Self::Decrease => 0,
            Self::Increase => 1,
            Self::Set => 2,
        }
    }

    pub fn from_mode(mode: u8) -> DgLabResult<Self> {
        match mode {
            0 => Ok(Self::Decrease),
            1 => Ok(Self::Increase),
            2 => Ok(Self::Set),
            _ => Err(DgLabError::InvalidMessage(format!(
                "unknown strength mode {mode}"
            ))),
        }
    }
}

/// Strength snapshot reported by the App.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StrengthData {
    pub a: u8,
    pub b: u8,
    pub a_limit: u8,
    pub b_limit: u8,
}

impl StrengthData {
    pub fn limit(&self, channel: Channel) -> u8 {
        match channel {
            Channel::A => self.a_limit,
            Channel::B => self.b_limit,
        }
    }

    pub fn current(&self, channel: Channel) -> u8 {
        match channel {
            Channel::A => self.a,
            Channel::B => self.b,
        }
    }
}

/// One of the App's ten feedback buttons (0-4 on channel A, 5-9 on B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedbackButton(u8);

impl FeedbackButton {
    pub fn from_index(index: u8) -> DgLabResult<Self> {
        if index <= 9 {
            Ok(Self(index))
        } else {
            Err(DgLabError::InvalidMessage(format!(
                "feedback button out of range: {index}"
            )))
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn channel(self) -> Channel {
        if self.0 < 5 {
            Channel::A
        } else {
            Channel::B
        }
    }
}
