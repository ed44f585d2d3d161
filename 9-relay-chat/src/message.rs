use std::{fmt, sync::Arc};

use crate::frame;

/// Immutable, delimiter-terminated payload shared by every write that sends it.
///
/// Cloning is a reference-count bump, so a broadcast builds one buffer and
/// hands a clone to each target's write queue. The bytes are freed when the
/// last in-flight write drops its clone.
#[derive(Clone, PartialEq, Eq)]
pub struct MessageBuffer {
    bytes: Arc<[u8]>,
}

impl MessageBuffer {
    pub fn new(text: &str) -> Self {
        Self::from_payload(text.as_bytes())
    }

    pub fn from_payload(payload: &[u8]) -> Self {
        Self {
            bytes: frame::encode(payload).into(),
        }
    }

    /// Bytes to put on the wire, delimiter included.
    pub fn as_wire(&self) -> &[u8] {
        &self.bytes
    }

    /// Payload without the trailing delimiter.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 1]
    }

    /// Number of live handles to this buffer, including `self`.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.bytes)
    }
}

impl fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageBuffer")
            .field(&String::from_utf8_lossy(self.payload()))
            .finish()
    }
}

/// Why the server let go of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Timeout,
    ConnectionClosed,
    DuplicateName,
    Error,
}

impl DisconnectReason {
    /// Text shown to peers inside departure and eviction notices.
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Timeout => "Timeout",
            DisconnectReason::ConnectionClosed => "Connection Closed",
            DisconnectReason::DuplicateName => "Name already taken",
            DisconnectReason::Error => "Server Error",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const NAME_TAKEN: &str = "Chosen name already exists!";
pub const SERVER_TERMINATING: &str = "Server Terminating";

pub fn joined(name: &str) -> String {
    format!("{name} has joined!")
}

pub fn left(name: &str, reason: DisconnectReason) -> String {
    format!("{name} has left the chat({reason})")
}

/// Relay payload `name:text`. The text is relayed byte for byte.
pub fn chat(name: &str, text: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(name.len() + 1 + text.len());
    payload.extend_from_slice(name.as_bytes());
    payload.push(b':');
    payload.extend_from_slice(text);
    payload
}

pub fn disconnected(reason: DisconnectReason) -> String {
    format!("You have been disconnected({reason})")
}
