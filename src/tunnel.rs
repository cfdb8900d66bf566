use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::codec::Reassembler;
use crate::link::FrameWriter;
use crate::listener::Delivery;
use crate::message::{Message, MessageKind};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("connection to backend {backend} failed (count: {count}): {source}")]
    Connect {
        backend: String,
        count: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Failed connection attempts are reported for the first ten in a row, then
/// only every tenth, so a long outage does not flood the log.
pub fn should_report_failure(count: u32) -> bool {
    count <= 10 || count % 10 == 0
}

/// Frontend end of the tunnel: the single TCP connection to the backend.
///
/// The connection is established lazily by the first outbound message and
/// re-established the same way after it is lost; there is no reconnect
/// timer. Messages that cannot be sent are dropped.
pub struct TunnelClient {
    backend: String,
    delivery: Delivery,
    link: Mutex<Option<FrameWriter>>,
    connecting: tokio::sync::Mutex<()>,
    failures: AtomicU32,
}

impl TunnelClient {
    /// `backend` is a `host:port` resolved on every connection attempt.
    /// Decoded `DataTransfer` messages from the backend go to `delivery`.
    pub fn new(backend: impl Into<String>, delivery: Delivery) -> Arc<Self> {
        Arc::new(TunnelClient {
            backend: backend.into(),
            delivery,
            link: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            failures: AtomicU32::new(0),
        })
    }

    pub fn state(&self) -> TunnelState {
        if self.live_link().is_some() {
            TunnelState::Connected
        } else if self.connecting.try_lock().is_err() {
            TunnelState::Connecting
        } else {
            TunnelState::Disconnected
        }
    }

    /// Connection attempts that failed since the last successful one.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Hands `message` to the tunnel without waiting. When connected it is
    /// queued right away; otherwise a task connects first. Failures only show
    /// up in the log.
    pub fn forward(self: &Arc<Self>, message: Message) {
        if let Some(link) = self.live_link() {
            link.write(message);
            return;
        }

        let tunnel = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = tunnel.send(message).await {
                tracing::trace!("dropping datagram: {e}");
            }
        });
    }

    /// Sends `message`, connecting first if needed.
    pub async fn send(&self, message: Message) -> Result<(), TunnelError> {
        let link = match self.live_link() {
            Some(link) => link,
            None => self.connect().await?,
        };
        link.write(message);
        Ok(())
    }

    fn live_link(&self) -> Option<FrameWriter> {
        self.link
            .lock()
            .as_ref()
            .filter(|link| !link.is_closing())
            .cloned()
    }

    /// Only one attempt runs at a time; callers that queued up behind it
    /// reuse its connection instead of opening their own.
    async fn connect(&self) -> Result<FrameWriter, TunnelError> {
        let _guard = self.connecting.lock().await;
        if let Some(link) = self.live_link() {
            return Ok(link);
        }

        tracing::debug!("connect to tcp {}", self.backend);
        let stream = match TcpStream::connect(self.backend.as_str()).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.failed(e)),
        };
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => return Err(self.failed(e)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, "set_nodelay failed: {e}");
        }
        self.failures.store(0, Ordering::Relaxed);

        let (reader, writer) = stream.into_split();
        let closed = CancellationToken::new();
        let link = FrameWriter::spawn(writer, peer, closed.clone());
        tokio::spawn(read_backend(reader, peer, self.delivery.clone(), closed));

        *self.link.lock() = Some(link.clone());
        tracing::info!("Connected to backend {peer}");
        Ok(link)
    }

    fn failed(&self, source: io::Error) -> TunnelError {
        let count = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if should_report_failure(count) {
            tracing::warn!(
                "Connection to backend {} refused (count: {count}): {source}",
                self.backend
            );
        }
        TunnelError::Connect {
            backend: self.backend.clone(),
            count,
            source,
        }
    }
}

/// Reads frames from the backend until the connection ends, delivering
/// replies to clients. Any exit marks the link closed so the next send
/// reconnects.
async fn read_backend(
    mut reader: OwnedReadHalf,
    peer: SocketAddr,
    delivery: Delivery,
    closed: CancellationToken,
) {
    let mut reassembler = Reassembler::new();

    'read: loop {
        let read = tokio::select! {
            _ = closed.cancelled() => break,
            read = reader.read_buf(reassembler.buffer_mut()) => read,
        };
        match read {
            Ok(0) => {
                tracing::info!("Backend {peer} has disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Connection to backend {peer} has been lost: {e}");
                break;
            }
        }

        for message in &mut reassembler {
            match message {
                Ok(message) => dispatch(&delivery, message).await,
                Err(e) => {
                    tracing::error!("dropping backend {peer} after undecodable frame: {e}");
                    break 'read;
                }
            }
        }
    }

    closed.cancel();
}

async fn dispatch(delivery: &Delivery, message: Message) {
    let client = message.client();
    match message.kind() {
        MessageKind::DataTransfer => delivery.deliver(message.payload(), client).await,
        MessageKind::ConnectionOpen => tracing::info!("Client {client} has connected"),
        MessageKind::ConnectionClose => tracing::info!("Client {client} has disconnected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, UdpSocket};

    async fn delivery() -> Delivery {
        Delivery::new(Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()))
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn test_failure_report_policy() {
        let reported: Vec<u32> = (1..=35).filter(|n| should_report_failure(*n)).collect();
        assert_eq!(reported, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 20, 30]);
        assert!(!should_report_failure(13));
    }

    #[tokio::test]
    async fn test_unreachable_backend_counts_failures() {
        let backend = closed_port().await;
        let tunnel = TunnelClient::new(backend.to_string(), delivery().await);
        let client: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        for expected in 1..=3 {
            match tunnel.send(Message::data(client, &b"ping"[..]).unwrap()).await {
                Err(TunnelError::Connect { count, .. }) => assert_eq!(count, expected),
                Ok(()) => panic!("send to a closed port succeeded"),
            }
        }
        assert_eq!(tunnel.consecutive_failures(), 3);
        assert_eq!(tunnel.state(), TunnelState::Disconnected);
    }

    #[tokio::test]
    async fn test_success_resets_failures_and_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        let tunnel = TunnelClient::new(backend.to_string(), delivery().await);
        let client: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        tunnel.failures.store(7, Ordering::Relaxed);
        tunnel.send(Message::data(client, &b"a"[..]).unwrap()).await.unwrap();
        assert_eq!(tunnel.consecutive_failures(), 0);
        assert_eq!(tunnel.state(), TunnelState::Connected);

        tunnel.send(Message::data(client, &b"b"[..]).unwrap()).await.unwrap();
        let (_conn, _) = listener.accept().await.unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err(), "a second connection was opened");
    }

    #[tokio::test]
    async fn test_concurrent_sends_open_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        let tunnel = TunnelClient::new(backend.to_string(), delivery().await);
        let client: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        let sends: Vec<_> = (0..20u8)
            .map(|i| {
                let tunnel = tunnel.clone();
                tokio::spawn(async move { tunnel.send(Message::data(client, vec![i]).unwrap()).await })
            })
            .collect();
        for send in sends {
            send.await.unwrap().unwrap();
        }

        let (_conn, _) = listener.accept().await.unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err(), "a second connection was opened");
    }

    #[tokio::test]
    async fn test_backend_close_marks_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        let tunnel = TunnelClient::new(backend.to_string(), delivery().await);
        let client: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        tunnel.send(Message::data(client, &b"a"[..]).unwrap()).await.unwrap();
        let (conn, _) = listener.accept().await.unwrap();
        drop(conn);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while tunnel.state() == TunnelState::Connected {
            assert!(tokio::time::Instant::now() < deadline, "closure never detected");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(tunnel.state(), TunnelState::Disconnected);

        // The next send reconnects lazily
        tunnel.send(Message::data(client, &b"b"[..]).unwrap()).await.unwrap();
        listener.accept().await.unwrap();
    }
}
