//! Relay wire protocol.
//!
//! Plain text, newline-delimited, no length prefix and no encoding
//! negotiation. Clients send arbitrary bytes; every `\n` ends a line.
//!
//! ## Server to client
//!
//! ```text
//! server: client <identity> just arrived\n
//! server: client <identity> just left\n
//! client <identity>: <line>\n
//! ```
//!
//! `<identity>` is the decimal client number and `<line>` is the submitted
//! line without its delimiter (possibly empty). Nothing else is ever written
//! to a client, including errors.

pub mod framer;
pub mod message;

pub use framer::LineBuffer;
pub use message::{Identity, Message};
