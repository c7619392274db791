//! Outbound message formatting.

use bytes::BytesMut;
use std::fmt;

/// Server-assigned client number shown to other clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity(pub u64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A line sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message<'a> {
    /// A new client was accepted.
    Arrived(Identity),
    /// A client disconnected.
    Left(Identity),
    /// A complete line submitted by a client, delimiter already stripped.
    Relay(Identity, &'a [u8]),
}

impl Message<'_> {
    /// Render the message including its trailing `\n`.
    pub fn encode(&self) -> BytesMut {
        match self {
            Message::Arrived(id) => {
                BytesMut::from(format!("server: client {id} just arrived\n").as_bytes())
            }
            Message::Left(id) => {
                BytesMut::from(format!("server: client {id} just left\n").as_bytes())
            }
            Message::Relay(id, line) => {
                let prefix = format!("client {id}: ");
                let mut out = BytesMut::with_capacity(prefix.len() + line.len() + 1);
                out.extend_from_slice(prefix.as_bytes());
                out.extend_from_slice(line);
                out.extend_from_slice(b"\n");
                out
            }
        }
    }
}
