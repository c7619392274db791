//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Readiness
//!
//! mio reports readiness edges, not levels. Each pass performs at most one
//! bounded read per readable connection; a connection whose read did not
//! end in `WouldBlock` is carried into the next pass, which then polls with
//! a zero timeout. A client that never stops sending therefore gets one read
//! per pass like everyone else instead of holding the loop.
//!
//! Write readiness is tracked per connection: a connection counts as
//! writable from the moment it is accepted until a write returns
//! `WouldBlock`, and becomes writable again on its next writable event.
//!
//! ## Ordering
//!
//! Events of one poll pass are handled in ascending token order, writable
//! events before readable ones. The listener uses the highest token, so
//! connections accepted in a pass never see events meant for an earlier
//! owner of their handle.

use crate::config::{Config, SendFailurePolicy};
use crate::protocol::Message;
use crate::runtime::{Handle, Registry};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Readiness of one source within a poll pass.
#[derive(Debug, Clone, Copy, Default)]
struct Readiness {
    readable: bool,
    writable: bool,
}

/// Single-threaded relay server.
///
/// Owns the listener, the poll instance and every client connection.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    registry: Registry<TcpStream>,
    read_buf: Vec<u8>,
    /// Connections that may still have unread input.
    unread: BTreeSet<Handle>,
    send_failure: SendFailurePolicy,
}

impl Server {
    /// Create the listening socket and register it for readiness.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let ip: IpAddr = config
            .host
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let addr = SocketAddr::new(ip, config.port);

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr, config.backlog)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            listener,
            registry: Registry::new(config.max_connections),
            read_buf: vec![0u8; config.read_buffer_size],
            unread: BTreeSet::new(),
            send_failure: config.send_failure,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve clients until a fatal error occurs.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            max_connections = self.registry.capacity(),
            read_buffer_size = self.read_buf.len(),
            send_failure = ?self.send_failure,
            "Relay listening"
        );

        loop {
            self.turn(None)?;
        }
    }

    /// Wait for readiness once and dispatch every event.
    ///
    /// `timeout` bounds the wait only when no connection has input left
    /// over from the previous pass.
    fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = if self.unread.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => {
                error!(error = %e, "Poll failed");
                return Err(e);
            }
        }

        let mut ready: BTreeMap<Token, Readiness> = BTreeMap::new();
        for event in self.events.iter() {
            let r = ready.entry(event.token()).or_default();
            r.readable |= event.is_readable() || event.is_read_closed() || event.is_error();
            r.writable |= event.is_writable();
        }
        for handle in std::mem::take(&mut self.unread) {
            ready.entry(Token(handle.0)).or_default().readable = true;
        }

        for (&token, _) in ready.iter().filter(|(t, r)| r.writable && **t != LISTENER_TOKEN) {
            self.handle_writable(Handle(token.0))?;
        }

        for (&token, _) in ready.iter().filter(|(_, r)| r.readable) {
            match token {
                LISTENER_TOKEN => self.accept_connections()?,
                Token(key) => self.handle_readable(Handle(key))?,
            }
        }

        Ok(())
    }

    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let (handle, identity) = match self.registry.register(stream) {
                        Ok(assigned) => assigned,
                        Err(e) => {
                            // The rejected stream has already been dropped and closed.
                            warn!(peer = %peer, error = %e, "Rejecting connection");
                            continue;
                        }
                    };

                    if let Some(conn) = self.registry.get_mut(handle) {
                        self.poll.registry().register(
                            conn.stream_mut(),
                            Token(handle.0),
                            Interest::READABLE | Interest::WRITABLE,
                        )?;
                    }

                    debug!(
                        handle = %handle,
                        identity = %identity,
                        peer = %peer,
                        clients = self.registry.len(),
                        high_water = ?self.registry.high_water(),
                        "Accepted connection"
                    );

                    self.broadcast(Some(handle), Message::Arrived(identity))?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Perform one bounded read and relay every line it completes.
    fn handle_readable(&mut self, handle: Handle) -> io::Result<()> {
        let Some(conn) = self.registry.get_mut(handle) else {
            return Ok(());
        };

        let n = loop {
            match conn.stream_mut().read(&mut self.read_buf) {
                Ok(0) => {
                    debug!(handle = %handle, identity = %conn.identity(), "Peer closed connection");
                    return self.disconnect(handle);
                }
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(handle = %handle, error = %e, "Read failed");
                    return self.disconnect(handle);
                }
            }
        };

        let identity = conn.identity();
        conn.pending.push(&self.read_buf[..n]);
        self.unread.insert(handle);

        while let Some(line) = self
            .registry
            .get_mut(handle)
            .and_then(|conn| conn.pending.next_line())
        {
            trace!(identity = %identity, len = line.len(), "Relaying line");
            self.broadcast(Some(handle), Message::Relay(identity, &line))?;
        }
        Ok(())
    }

    fn handle_writable(&mut self, handle: Handle) -> io::Result<()> {
        let result = match self.registry.get_mut(handle) {
            Some(conn) => conn.on_writable(),
            None => return Ok(()),
        };

        if let Err(e) = result {
            self.on_send_failure(handle, e)?;
            self.disconnect(handle)?;
        }
        Ok(())
    }

    /// Send `message` to every writable client except `sender`.
    fn broadcast(&mut self, sender: Option<Handle>, message: Message<'_>) -> io::Result<()> {
        let payload = message.encode();
        for (handle, e) in self.registry.broadcast(sender, &payload) {
            self.on_send_failure(handle, e)?;
            self.disconnect(handle)?;
        }
        Ok(())
    }

    /// Announce departure of `handle` to the remaining clients and close it.
    ///
    /// Recipients that fail while receiving the notice are disconnected the
    /// same way.
    fn disconnect(&mut self, handle: Handle) -> io::Result<()> {
        let mut leaving = VecDeque::from([handle]);

        while let Some(handle) = leaving.pop_front() {
            let Some(identity) = self.registry.identity_of(handle) else {
                continue;
            };

            let payload = Message::Left(identity).encode();
            let failed = self.registry.broadcast(Some(handle), &payload);
            self.close_connection(handle);

            for (failed_handle, e) in failed {
                self.on_send_failure(failed_handle, e)?;
                leaving.push_back(failed_handle);
            }
        }
        Ok(())
    }

    /// Apply the configured send failure policy.
    fn on_send_failure(&self, handle: Handle, e: io::Error) -> io::Result<()> {
        match self.send_failure {
            SendFailurePolicy::Fatal => {
                error!(handle = %handle, error = %e, "Send failed");
                Err(e)
            }
            SendFailurePolicy::Drop => {
                warn!(handle = %handle, error = %e, "Send failed, dropping client");
                Ok(())
            }
        }
    }

    fn close_connection(&mut self, handle: Handle) {
        self.unread.remove(&handle);
        if let Some(mut conn) = self.registry.unregister(handle) {
            let _ = self.poll.registry().deregister(conn.stream_mut());
            debug!(
                handle = %handle,
                identity = %conn.identity(),
                discarded = conn.pending.len(),
                unsent = conn.outbound_len(),
                clients = self.registry.len(),
                "Connection closed"
            );
        }
    }
}

/// Create a non-blocking TCP listener with the given backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Identity;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{Shutdown, TcpStream as StdTcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            backlog: 100,
            max_connections: 64,
            // Small reads so lines routinely span several of them.
            read_buffer_size: 16,
            event_capacity: 64,
            send_failure: SendFailurePolicy::Drop,
            log_level: "info".to_string(),
        }
    }

    fn start_server(config: Config) -> SocketAddr {
        let mut server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());
        addr
    }

    struct TestClient {
        reader: BufReader<StdTcpStream>,
        writer: StdTcpStream,
    }

    impl TestClient {
        fn connect(addr: SocketAddr) -> Self {
            let stream = StdTcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let writer = stream.try_clone().unwrap();
            Self {
                reader: BufReader::new(stream),
                writer,
            }
        }

        fn send(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).unwrap();
        }

        fn recv_line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            line
        }

        /// Assert nothing arrives within a short window.
        fn assert_silent(&mut self) {
            self.reader
                .get_ref()
                .set_read_timeout(Some(Duration::from_millis(200)))
                .unwrap();
            let mut buf = [0u8; 64];
            match self.reader.read(&mut buf) {
                Ok(n) => panic!(
                    "unexpected data: {:?}",
                    String::from_utf8_lossy(&buf[..n])
                ),
                Err(e) => assert!(
                    matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ),
                    "unexpected error: {e}"
                ),
            }
            self.reader
                .get_ref()
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
        }
    }

    /// Connect A (identity 0) then B (identity 1) and consume B's arrival on A.
    fn pair(addr: SocketAddr) -> (TestClient, TestClient) {
        let mut a = TestClient::connect(addr);
        let b = TestClient::connect(addr);
        assert_eq!(a.recv_line(), "server: client 1 just arrived\n");
        (a, b)
    }

    #[test]
    fn test_bind_reports_address() {
        let server = Server::bind(&test_config()).unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_bind_rejects_bad_host() {
        let mut config = test_config();
        config.host = "not an address".to_string();
        let err = Server::bind(&config).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_single_line() {
        let addr = start_server(test_config());
        let (mut a, mut b) = pair(addr);

        b.send(b"hello\n");
        assert_eq!(a.recv_line(), "client 1: hello\n");
    }

    #[test]
    fn test_split_send() {
        let addr = start_server(test_config());
        let (mut a, mut b) = pair(addr);

        b.send(b"hel");
        a.assert_silent();
        b.send(b"lo\n");
        assert_eq!(a.recv_line(), "client 1: hello\n");
    }

    #[test]
    fn test_multiple_lines_in_one_write() {
        let addr = start_server(test_config());
        let (mut a, mut b) = pair(addr);

        b.send(b"a\nb\nc");
        assert_eq!(a.recv_line(), "client 1: a\n");
        assert_eq!(a.recv_line(), "client 1: b\n");
        a.assert_silent();

        b.send(b"\n");
        assert_eq!(a.recv_line(), "client 1: c\n");
    }

    #[test]
    fn test_empty_line() {
        let addr = start_server(test_config());
        let (mut a, mut b) = pair(addr);

        b.send(b"\n");
        assert_eq!(a.recv_line(), "client 1: \n");
    }

    #[test]
    fn test_line_longer_than_read_buffer() {
        let addr = start_server(test_config());
        let (mut a, mut b) = pair(addr);

        let payload = "x".repeat(1000);
        b.send(format!("{payload}\n").as_bytes());
        assert_eq!(a.recv_line(), format!("client 1: {payload}\n"));
    }

    #[test]
    fn test_no_self_echo() {
        let addr = start_server(test_config());
        let (mut a, mut b) = pair(addr);

        b.send(b"ping\n");
        assert_eq!(a.recv_line(), "client 1: ping\n");
        b.assert_silent();
    }

    #[test]
    fn test_disconnection() {
        let addr = start_server(test_config());
        let (mut a, b) = pair(addr);

        drop(b);
        assert_eq!(a.recv_line(), "server: client 1 just left\n");

        let _c = TestClient::connect(addr);
        assert_eq!(a.recv_line(), "server: client 2 just arrived\n");
    }

    #[test]
    fn test_partial_line_dropped_on_disconnect() {
        let addr = start_server(test_config());
        let (mut a, mut b) = pair(addr);

        b.send(b"unterminated");
        drop(b);
        assert_eq!(a.recv_line(), "server: client 1 just left\n");
        a.assert_silent();
    }

    #[test]
    fn test_identities_are_never_reused() {
        let addr = start_server(test_config());
        let mut watcher = TestClient::connect(addr);

        for round in 1..=4 {
            let peer = TestClient::connect(addr);
            assert_eq!(
                watcher.recv_line(),
                format!("server: client {round} just arrived\n")
            );
            drop(peer);
            assert_eq!(
                watcher.recv_line(),
                format!("server: client {round} just left\n")
            );
        }
    }

    #[test]
    fn test_fan_out_to_all_others() {
        let addr = start_server(test_config());
        let (mut a, mut b) = pair(addr);
        let mut c = TestClient::connect(addr);
        assert_eq!(a.recv_line(), "server: client 2 just arrived\n");
        assert_eq!(b.recv_line(), "server: client 2 just arrived\n");

        c.send(b"hi all\n");
        assert_eq!(a.recv_line(), "client 2: hi all\n");
        assert_eq!(b.recv_line(), "client 2: hi all\n");
        c.assert_silent();
    }

    #[test]
    fn test_connection_limit() {
        let mut config = test_config();
        config.max_connections = 1;
        let addr = start_server(config);

        let mut a = TestClient::connect(addr);
        let mut rejected = TestClient::connect(addr);

        // The server closes the surplus connection without a word.
        assert_eq!(rejected.recv_line(), "");
        a.assert_silent();
    }

    #[test]
    fn test_flooding_client_does_not_starve_others() {
        let addr = start_server(test_config());
        let (mut a, b) = pair(addr);
        let mut c = TestClient::connect(addr);
        assert_eq!(a.recv_line(), "server: client 2 just arrived\n");

        let stop = Arc::new(AtomicBool::new(false));
        let mut flood = b.writer.try_clone().unwrap();
        flood
            .set_write_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let flooding = Arc::clone(&stop);
        thread::spawn(move || {
            let chunk = vec![b'x'; 1 << 20];
            while !flooding.load(Ordering::Relaxed) {
                if flood.write_all(&chunk).is_err() {
                    break;
                }
            }
        });

        thread::sleep(Duration::from_millis(100));
        c.send(b"hi\n");
        assert_eq!(a.recv_line(), "client 2: hi\n");
        stop.store(true, Ordering::Relaxed);
    }

    /// Drive `server` on the calling thread until `done` holds.
    fn turn_until(server: &mut Server, done: impl Fn(&Server) -> bool) {
        for _ in 0..250 {
            if done(server) {
                return;
            }
            server.turn(Some(Duration::from_millis(20))).unwrap();
        }
        panic!("server never reached the expected state");
    }

    fn handle_of(server: &Server, identity: Identity) -> Handle {
        server
            .registry
            .members()
            .find(|&h| server.registry.identity_of(h) == Some(identity))
            .unwrap()
    }

    /// Accept A, B and C, then make every write to B fail with a broken pipe.
    ///
    /// B's client end is returned so it stays open and the server never
    /// sees it leave on its own.
    fn three_clients_with_broken_b(
        policy: SendFailurePolicy,
    ) -> (Server, TestClient, TestClient, TestClient, Handle) {
        let mut config = test_config();
        config.send_failure = policy;
        let mut server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();

        let mut a = TestClient::connect(addr);
        let b_client = TestClient::connect(addr);
        let c = TestClient::connect(addr);
        turn_until(&mut server, |s| s.registry.len() == 3);
        assert_eq!(a.recv_line(), "server: client 1 just arrived\n");
        assert_eq!(a.recv_line(), "server: client 2 just arrived\n");

        let b = handle_of(&server, Identity(1));
        server
            .registry
            .get(b)
            .unwrap()
            .stream()
            .shutdown(Shutdown::Write)
            .unwrap();
        (server, a, b_client, c, b)
    }

    #[test]
    fn test_drop_policy_disconnects_failing_recipient() {
        let (mut server, mut a, _b, mut c, b) =
            three_clients_with_broken_b(SendFailurePolicy::Drop);

        c.send(b"hello\n");
        turn_until(&mut server, |s| s.registry.identity_of(b).is_none());

        assert_eq!(a.recv_line(), "client 2: hello\n");
        assert_eq!(a.recv_line(), "server: client 1 just left\n");
        assert_eq!(c.recv_line(), "server: client 1 just left\n");

        // The departure is announced once and the others keep being served.
        server.turn(Some(Duration::from_millis(50))).unwrap();
        a.assert_silent();
        c.assert_silent();
        c.send(b"still here\n");
        turn_until(&mut server, |s| !s.unread.is_empty());
        assert_eq!(a.recv_line(), "client 2: still here\n");
        assert_eq!(server.registry.len(), 2);
    }

    #[test]
    fn test_fatal_policy_stops_server() {
        let (mut server, _a, _b, mut c, _) =
            three_clients_with_broken_b(SendFailurePolicy::Fatal);

        c.send(b"hello\n");
        let mut result = Ok(());
        for _ in 0..250 {
            result = server.turn(Some(Duration::from_millis(20)));
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }
}
