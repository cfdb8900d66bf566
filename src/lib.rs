//! Tunnels UDP sessions over a single TCP connection.
//!
//! The frontend ([`Listener`] + [`TunnelClient`]) faces real UDP clients and
//! multiplexes their datagrams onto one TCP connection. The backend
//! ([`Server`]) accepts that connection and gives every client address its own
//! relay socket towards the origin UDP service, evicting relays that go idle.

pub mod codec;
pub mod config;
pub mod link;
pub mod listener;
pub mod message;
pub mod relay;
pub mod server;
pub mod tunnel;

pub use codec::{frame, FrameCodec, Reassembler};
pub use config::{BackendConfig, FrontendConfig};
pub use listener::{Delivery, Listener};
pub use message::{CodecError, Message, MessageKind, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};
pub use server::{Server, ServerConnection};
pub use tunnel::{should_report_failure, TunnelClient, TunnelError, TunnelState};
