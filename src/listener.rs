use bytes::Bytes;
use eyre::WrapErr;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::config::FrontendConfig;
use crate::message::Message;
use crate::tunnel::TunnelClient;

/// Narrow handle the tunnel uses to answer clients from the listener's
/// socket, so replies come from the address clients sent to.
#[derive(Debug, Clone)]
pub struct Delivery {
    socket: Arc<UdpSocket>,
}

impl Delivery {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Delivery { socket }
    }

    /// Sends `payload` to `client` as one datagram. Failures are logged only.
    pub async fn deliver(&self, payload: &[u8], client: SocketAddr) {
        if let Err(e) = self.socket.send_to(payload, client).await {
            tracing::warn!("udp send to client {client} failed: {e}");
        }
    }
}

/// Frontend UDP endpoint facing the real clients.
pub struct Listener {
    socket: Arc<UdpSocket>,
    tunnel: Arc<TunnelClient>,
}

impl Listener {
    pub async fn bind(config: &FrontendConfig) -> eyre::Result<Self> {
        tracing::debug!("bind to udp {}:{}", config.host, config.port);
        let socket = UdpSocket::bind((config.host.as_str(), config.port))
            .await
            .wrap_err("udp-bind")?;
        let socket = Arc::new(socket);
        let tunnel = TunnelClient::new(config.backend_endpoint(), Delivery::new(socket.clone()));

        tracing::info!(
            "listening for clients on udp {}, tunneling to backend {}",
            socket.local_addr().wrap_err("udp local address")?,
            config.backend_endpoint()
        );
        Ok(Listener { socket, tunnel })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn tunnel(&self) -> &Arc<TunnelClient> {
        &self.tunnel
    }

    /// Wraps every client datagram and forwards it through the tunnel.
    /// Never returns under normal operation.
    pub async fn run(self) -> eyre::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, client)) => {
                    tracing::trace!(%client, len, "client datagram");
                    match Message::data(client, Bytes::copy_from_slice(&buf[..len])) {
                        Ok(message) => self.tunnel.forward(message),
                        Err(e) => tracing::warn!("dropping datagram from {client}: {e}"),
                    }
                }
                Err(e) => {
                    tracing::warn!("UDP recv failed: {e}");
                    // Brief delay to prevent tight error loops when UDP socket is in bad state
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
