use chrono::{DateTime, Local};
use std::fmt;

/// One publish taken off the session, stamped with its arrival time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub channel: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl ReceivedMessage {
    pub fn new(channel: String, payload: Vec<u8>) -> Self {
        ReceivedMessage {
            channel,
            payload,
            received_at: Local::now(),
        }
    }

    /// Payload as text for logging, invalid UTF-8 replaced.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}] Received msg('{}'): {}",
            self.received_at.format("%a %b %e %H:%M:%S %Y"),
            self.channel,
            self.payload_text()
        )
    }
}
