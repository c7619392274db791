//! Connection state and the registry of live connections.
//!
//! Each connection tracks its client identity, the partial line read so far
//! and whatever part of the last outbound message the socket did not accept.
//! The registry owns every connection and performs broadcast fan-out.

use crate::protocol::{Identity, LineBuffer};
use bytes::{Buf, BytesMut};
use slab::Slab;
use std::fmt;
use std::io::{self, Write};

/// Opaque key of a live connection, also used as its poll token.
///
/// A handle value is only handed out again after the previous owner has
/// been unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub usize);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    identity: Identity,
    /// Input received after the last line delimiter.
    pub pending: LineBuffer,
    /// Unsent tail of the last message queued to this client.
    outbound: BytesMut,
    /// Whether a write is expected to make progress.
    writable: bool,
}

impl<S> Connection<S> {
    fn new(stream: S, identity: Identity) -> Self {
        Self {
            stream,
            identity,
            pending: LineBuffer::new(),
            outbound: BytesMut::new(),
            // Freshly accepted sockets have an empty send buffer.
            writable: true,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    #[cfg(test)]
    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Whether this connection is a broadcast recipient right now.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Bytes still waiting to be written.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }
}

impl<S: Write> Connection<S> {
    /// Queue `payload` and write as much as the socket accepts.
    pub fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.outbound.extend_from_slice(payload);
        self.flush()
    }

    /// Handle a write-readiness notification.
    pub fn on_writable(&mut self) -> io::Result<()> {
        self.writable = true;
        self.flush()
    }

    /// Write queued bytes until done or the socket would block.
    ///
    /// On `WouldBlock` the remainder stays queued and the connection stops
    /// being a broadcast recipient until the next write-readiness event.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// `max_connections` connections are already live.
    Full { max_connections: usize },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Full { max_connections } => {
                write!(f, "connection limit of {max_connections} reached")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Registry of live connections using slab allocation.
///
/// Iteration is in ascending handle order, which fixes the order in which
/// recipients receive a broadcast.
pub struct Registry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
    next_identity: u64,
    high_water: Option<Handle>,
}

impl<S> Registry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
            next_identity: 0,
            high_water: None,
        }
    }

    /// Add a connection and assign it the next identity.
    ///
    /// Identities are only consumed by successful registrations.
    pub fn register(&mut self, stream: S) -> Result<(Handle, Identity), RegistryError> {
        if self.connections.len() >= self.max_connections {
            return Err(RegistryError::Full {
                max_connections: self.max_connections,
            });
        }

        let identity = Identity(self.next_identity);
        self.next_identity += 1;

        let handle = Handle(self.connections.insert(Connection::new(stream, identity)));
        if self.high_water.map_or(true, |hw| handle > hw) {
            self.high_water = Some(handle);
        }
        Ok((handle, identity))
    }

    /// Remove a connection, releasing its buffers.
    pub fn unregister(&mut self, handle: Handle) -> Option<Connection<S>> {
        let conn = self.connections.try_remove(handle.0)?;
        if self.high_water == Some(handle) {
            self.high_water = self.members().last();
        }
        Some(conn)
    }

    /// Live handles in ascending order.
    pub fn members(&self) -> impl Iterator<Item = Handle> + '_ {
        self.connections.iter().map(|(key, _)| Handle(key))
    }

    pub fn identity_of(&self, handle: Handle) -> Option<Identity> {
        self.connections.get(handle.0).map(Connection::identity)
    }

    #[cfg(test)]
    pub fn get(&self, handle: Handle) -> Option<&Connection<S>> {
        self.connections.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Connection<S>> {
        self.connections.get_mut(handle.0)
    }

    /// Highest live handle, if any.
    pub fn high_water(&self) -> Option<Handle> {
        self.high_water
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

impl<S: Write> Registry<S> {
    /// Send `payload` to every writable connection other than `sender`.
    ///
    /// Recipients are visited in ascending handle order. A failing recipient
    /// does not stop the fan-out; failures are returned to the caller.
    pub fn broadcast(
        &mut self,
        sender: Option<Handle>,
        payload: &[u8],
    ) -> Vec<(Handle, io::Error)> {
        let mut failed = Vec::new();
        for (key, conn) in self.connections.iter_mut() {
            let handle = Handle(key);
            if Some(handle) == sender || !conn.is_writable() {
                continue;
            }
            if let Err(e) = conn.send(payload) {
                failed.push((handle, e));
            }
        }
        failed
    }
}
