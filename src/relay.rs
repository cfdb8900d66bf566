use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::link::FrameWriter;
use crate::message::Message;

/// UDP socket dedicated to one client key on one tunnel connection.
///
/// It is connected to the origin, so everything it receives is a reply for
/// that client and goes back through the tunnel tagged with the client key.
/// Dropping it closes it.
#[derive(Debug)]
pub struct RelaySocket {
    key: SocketAddr,
    socket: Arc<UdpSocket>,
    last_accessed: Arc<Mutex<Instant>>,
    closed: CancellationToken,
}

impl RelaySocket {
    /// Binds an ephemeral socket of the origin's address family, connects it
    /// to `origin` and starts relaying replies for `key` onto `tunnel`.
    /// `closed` is normally a child of the tunnel connection's token.
    pub async fn open(
        origin: SocketAddr,
        key: SocketAddr,
        tunnel: FrameWriter,
        closed: CancellationToken,
    ) -> io::Result<Self> {
        let bind_ip = match origin {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        socket.connect(origin).await?;

        let socket = Arc::new(socket);
        let last_accessed = Arc::new(Mutex::new(Instant::now()));
        tokio::spawn(relay_replies(
            socket.clone(),
            key,
            tunnel,
            last_accessed.clone(),
            closed.clone(),
        ));

        Ok(RelaySocket {
            key,
            socket,
            last_accessed,
            closed,
        })
    }

    /// Sends a client payload to the origin.
    /// Delivery errors are logged; the socket stays open.
    pub async fn send_to(&self, payload: &[u8]) {
        self.touch();
        if let Err(e) = self.socket.send(payload).await {
            tracing::warn!(client = %self.key, "udp forward to origin failed: {e}");
        }
    }

    pub fn key(&self) -> SocketAddr {
        self.key
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }

    pub fn is_closing(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }
}

impl Drop for RelaySocket {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Receives origin replies until the socket is closed. Holds the last
/// reference to the socket once the table entry is gone, so the file
/// descriptor is released when this returns.
async fn relay_replies(
    socket: Arc<UdpSocket>,
    key: SocketAddr,
    tunnel: FrameWriter,
    last_accessed: Arc<Mutex<Instant>>,
    closed: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let received = tokio::select! {
            _ = closed.cancelled() => break,
            received = socket.recv(&mut buf) => received,
        };

        match received {
            Ok(len) => {
                *last_accessed.lock() = Instant::now();
                match Message::data(key, Bytes::copy_from_slice(&buf[..len])) {
                    Ok(message) => {
                        tracing::trace!(client = %key, len, "origin reply");
                        tunnel.write(message);
                    }
                    Err(e) => tracing::warn!(client = %key, "dropping origin reply: {e}"),
                }
            }
            // ICMP errors (port unreachable and friends) surface here on a
            // connected socket; they never end the session
            Err(e) => tracing::warn!(client = %key, "origin socket error: {e}"),
        }
    }
    tracing::debug!(client = %key, "relay socket closed");
}

/// Relay sessions of one tunnel connection, keyed by client address.
#[derive(Debug, Default)]
pub struct RelayTable {
    sessions: HashMap<SocketAddr, RelaySocket>,
}

impl RelayTable {
    pub fn new() -> Self {
        RelayTable::default()
    }

    /// Live relay for `key`; a socket that already started closing counts as
    /// absent.
    pub fn get(&self, key: &SocketAddr) -> Option<&RelaySocket> {
        self.sessions.get(key).filter(|relay| !relay.is_closing())
    }

    /// Stores `relay` under its key, closing whatever it replaces.
    pub fn insert(&mut self, relay: RelaySocket) {
        if let Some(old) = self.sessions.insert(relay.key(), relay) {
            old.close();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes and closes every relay whose last use is more than
    /// `idle_timeout` before `now`, returning their keys.
    pub fn evict_idle(&mut self, now: Instant, idle_timeout: Duration) -> Vec<SocketAddr> {
        let idle: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, relay)| now.saturating_duration_since(relay.last_accessed()) > idle_timeout)
            .map(|(key, _)| *key)
            .collect();

        for key in &idle {
            if let Some(relay) = self.sessions.remove(key) {
                if !relay.is_closing() {
                    relay.close();
                }
            }
        }
        idle
    }

    /// Closes and forgets every relay.
    pub fn close_all(&mut self) -> usize {
        let count = self.sessions.len();
        for (_, relay) in self.sessions.drain() {
            relay.close();
        }
        count
    }
}
