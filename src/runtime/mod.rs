//! Readiness-based relay runtime.
//!
//! - `Registry`: live connections, identities and broadcast fan-out
//! - `Server`: the mio event loop (epoll on Linux, kqueue on macOS)

mod connection;
mod event_loop;

pub(crate) use connection::{Handle, Registry};
pub use event_loop::Server;

use crate::config::Config;

/// Bind the listener and serve clients until a fatal error occurs.
pub fn run(config: &Config) -> std::io::Result<()> {
    let mut server = Server::bind(config)?;
    server.run()
}
