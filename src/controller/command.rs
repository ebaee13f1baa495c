//! Turns a (channel, payload) pair into a typed [`Command`].
//!
//! Matching is exact and case-sensitive, with no trimming: `"1 "` on the
//! control channel is not a command. A payload on an unknown channel is never
//! looked at.

use crate::mqtt::config::BrokerEndpoint;
use std::fmt;

/// Which of the two known channels a command came in on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Control,
    Schedule,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Control => write!(f, "control"),
            Channel::Schedule => write!(f, "schedule"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Open (`true`) or close the valve right away
    Immediate { on: bool },
    /// Keep the valve open for `seconds`, then close it
    TimedWater { seconds: u64 },
    /// Known channel, payload of the wrong shape
    Unrecognized { channel: Channel, reason: String },
    /// Any other channel
    Irrelevant,
}

pub fn decode(endpoint: &BrokerEndpoint, channel: &str, payload: &[u8]) -> Command {
    if channel == endpoint.control_channel {
        decode_control(payload)
    } else if channel == endpoint.schedule_channel {
        decode_schedule(payload)
    } else {
        Command::Irrelevant
    }
}

fn decode_control(payload: &[u8]) -> Command {
    match payload {
        b"1" => Command::Immediate { on: true },
        b"0" => Command::Immediate { on: false },
        other => Command::Unrecognized {
            channel: Channel::Control,
            reason: format!(
                "'{}' does not match any of the control states",
                String::from_utf8_lossy(other)
            ),
        },
    }
}

fn decode_schedule(payload: &[u8]) -> Command {
    let unrecognized = |reason: String| Command::Unrecognized {
        channel: Channel::Schedule,
        reason,
    };

    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => return unrecognized(format!("invalid JSON: {}", e)),
    };
    let Some(object) = value.as_object() else {
        return unrecognized("schedule is not a JSON object".to_string());
    };
    let Some(length) = object.get("length") else {
        return unrecognized("schedule has no 'length'".to_string());
    };

    match length.as_u64() {
        Some(seconds) => Command::TimedWater { seconds },
        None => unrecognized(format!("'length' is not a non-negative integer: {}", length)),
    }
}
