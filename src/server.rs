use eyre::WrapErr;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::codec::Reassembler;
use crate::config::BackendConfig;
use crate::link::FrameWriter;
use crate::message::{CodecError, Message, MessageKind};
use crate::relay::{RelaySocket, RelayTable};

/// Backend side of the tunnel: accepts frontend connections and relays their
/// clients to the origin service.
pub struct Server {
    listener: TcpListener,
    origin: SocketAddr,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl Server {
    pub async fn bind(config: &BackendConfig) -> eyre::Result<Self> {
        let origin = config.resolve_origin().await?;
        tracing::debug!("bind to tcp {}:{}", config.host, config.port);
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .wrap_err("tcp-listen")?;
        tracing::info!(
            "listening for frontends on {}, relaying to origin {origin}",
            listener.local_addr().wrap_err("tcp local address")?
        );

        Ok(Server {
            listener,
            origin,
            idle_timeout: config.idle_timeout,
            sweep_interval: config.sweep_interval,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn origin(&self) -> SocketAddr {
        self.origin
    }

    /// Accepts frontends forever, each on its own task.
    pub async fn run(self) -> eyre::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::info!("Frontend {peer} has connected");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, "set_nodelay failed: {e}");
                    }
                    let connection = ServerConnection::new(
                        peer,
                        self.origin,
                        self.idle_timeout,
                        self.sweep_interval,
                    );
                    tokio::spawn(connection.serve(stream));
                }
                Err(e) => {
                    tracing::error!("tcp accept failed: {e}");
                    // Brief delay to prevent tight error loops, e.g. when out of FDs
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// One accepted tunnel from a frontend.
///
/// The task running [`ServerConnection::serve`] is the only owner of the
/// relay table: frames, idle sweeps and teardown are handled one at a time
/// in a single loop, so a key can never get two relay sockets at once.
#[derive(Debug, Clone)]
pub struct ServerConnection {
    peer: SocketAddr,
    origin: SocketAddr,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl ServerConnection {
    pub fn new(
        peer: SocketAddr,
        origin: SocketAddr,
        idle_timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        ServerConnection {
            peer,
            origin,
            idle_timeout,
            sweep_interval,
        }
    }

    /// Runs the connection until the frontend goes away, the stream breaks or
    /// an undecodable frame arrives. Every relay socket is closed on the way
    /// out; returns how many were still open.
    pub async fn serve<S>(self, stream: S) -> usize
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = self.peer;
        let (mut reader, writer) = tokio::io::split(stream);
        let closed = CancellationToken::new();
        let tunnel = FrameWriter::spawn(writer, peer, closed.clone());

        let mut relays = RelayTable::new();
        let mut reassembler = Reassembler::new();
        let mut sweep =
            tokio::time::interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = closed.cancelled() => {
                    tracing::warn!("Connection from frontend {peer} has been closed");
                    break;
                }
                read = reader.read_buf(reassembler.buffer_mut()) => {
                    match read {
                        Ok(0) => {
                            tracing::info!("Frontend {peer} has disconnected");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("Connection from frontend {peer} has been lost: {e}");
                            break;
                        }
                    }
                    if let Err(e) = self.route_all(&mut reassembler, &mut relays, &tunnel).await {
                        tracing::error!("dropping frontend {peer} after undecodable frame: {e}");
                        break;
                    }
                }
                _ = sweep.tick() => self.sweep(&mut relays, &tunnel),
            }
        }

        tunnel.close();
        let released = relays.close_all();
        if released > 0 {
            tracing::info!("Released {released} relay sockets of frontend {peer}");
        }
        released
    }

    async fn route_all(
        &self,
        reassembler: &mut Reassembler,
        relays: &mut RelayTable,
        tunnel: &FrameWriter,
    ) -> Result<(), CodecError> {
        for message in reassembler {
            self.route(message?, relays, tunnel).await;
        }
        Ok(())
    }

    /// Sends a client datagram to the origin through the relay for its key,
    /// opening the relay (and announcing it) on first use.
    async fn route(&self, message: Message, relays: &mut RelayTable, tunnel: &FrameWriter) {
        if message.kind() != MessageKind::DataTransfer {
            tracing::debug!(
                client = %message.client(),
                kind = ?message.kind(),
                "ignoring non-data message from frontend"
            );
            return;
        }

        let key = message.client();
        if relays.get(&key).is_none() {
            tracing::info!("Client {key} via frontend {} has connected", self.peer);
            tunnel.write(Message::open(key));
            match RelaySocket::open(self.origin, key, tunnel.clone(), tunnel.closed().child_token())
                .await
            {
                Ok(relay) => relays.insert(relay),
                Err(e) => {
                    tracing::warn!("Failed to open relay socket for client {key}: {e}");
                    return;
                }
            }
        }

        if let Some(relay) = relays.get(&key) {
            relay.send_to(message.payload()).await;
        }
    }

    fn sweep(&self, relays: &mut RelayTable, tunnel: &FrameWriter) {
        for key in relays.evict_idle(Instant::now(), self.idle_timeout) {
            tracing::info!("Client {key} via frontend {} has disconnected", self.peer);
            tunnel.write(Message::close(key));
        }
    }
}
