use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use crate::codec::FrameCodec;
use crate::message::Message;

/// Messages waiting for the socket beyond this are dropped, like a full UDP
/// send buffer would.
const QUEUE_DEPTH: usize = 1024;

/// Stop coalescing queued frames into one write past this many bytes.
const MAX_BATCH_BYTES: usize = 64 * 1024;

/// Write side of a tunnel TCP connection.
///
/// Cloneable handle that frames messages onto the connection from a dedicated
/// task, so callers never wait on the socket. Writes after the connection
/// started closing are silently ignored.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    tx: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl FrameWriter {
    /// Spawns the writer task for `writer`. Cancelling `closed` (from either
    /// side) stops the task and shuts the write half down.
    pub fn spawn<W>(writer: W, peer: SocketAddr, closed: CancellationToken) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(write_frames(writer, rx, peer, closed.clone()));
        FrameWriter { tx, closed }
    }

    /// Queues `message` for the connection.
    /// Returns false if it was dropped because the connection is closing or
    /// the queue is full.
    pub fn write(&self, message: Message) -> bool {
        if self.is_closing() {
            return false;
        }
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                tracing::debug!(client = %message.client(), "tunnel queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Starts closing the connection; queued messages are discarded.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Token cancelled when this connection starts closing.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

async fn write_frames<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Message>,
    peer: SocketAddr,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut codec = FrameCodec;
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        buf.clear();
        encode_into(&mut codec, &message, &mut buf);
        // Coalesce whatever is already queued into the same write
        while buf.len() < MAX_BATCH_BYTES {
            match rx.try_recv() {
                Ok(message) => encode_into(&mut codec, &message, &mut buf),
                Err(_) => break,
            }
        }

        if let Err(e) = writer.write_all(&buf).await {
            tracing::warn!(%peer, "dropping tcp connection after failed write: {e}");
            closed.cancel();
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(%peer, "dropping tcp connection after failed flush: {e}");
            closed.cancel();
            break;
        }
    }

    rx.close();
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(%peer, "tcp shutdown: {e}");
    }
}

fn encode_into(codec: &mut FrameCodec, message: &Message, buf: &mut BytesMut) {
    if let Err(e) = codec.encode(message, buf) {
        tracing::error!(client = %message.client(), "failed to encode message: {e}");
    }
}
