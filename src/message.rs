use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Largest UDP payload that fits in a single IPv4 datagram.
pub const MAX_PAYLOAD_LEN: usize = 65507;

/// Largest encoded message a 2-byte length prefix can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Errors produced while building, encoding or decoding tunnel messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge(usize),

    #[error("frame too large: {0} bytes (max {MAX_FRAME_LEN})")]
    FrameTooLarge(usize),

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("unknown address family: {0}")]
    UnknownAddressFamily(u8),

    #[error("truncated message: {0} bytes is shorter than its header")]
    Truncated(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind tag carried in the first byte of every encoded message.
/// The integer values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    DataTransfer = 0,
    ConnectionOpen = 1,
    ConnectionClose = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageKind::DataTransfer),
            1 => Ok(MessageKind::ConnectionOpen),
            2 => Ok(MessageKind::ConnectionClose),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

/// A single tunneled message: a UDP payload (or a session notification)
/// tagged with the client address it belongs to.
///
/// Instances are immutable; the payload limit is checked on construction so
/// every `Message` in circulation can be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    client: SocketAddr,
    payload: Bytes,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        client: SocketAddr,
        payload: impl Into<Bytes>,
    ) -> Result<Self, CodecError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }
        Ok(Message {
            kind,
            client,
            payload,
        })
    }

    /// A `DataTransfer` message carrying a client datagram or an origin reply.
    pub fn data(client: SocketAddr, payload: impl Into<Bytes>) -> Result<Self, CodecError> {
        Message::new(MessageKind::DataTransfer, client, payload)
    }

    /// Notification that a relay session was created for `client`.
    pub fn open(client: SocketAddr) -> Self {
        Message {
            kind: MessageKind::ConnectionOpen,
            client,
            payload: Bytes::new(),
        }
    }

    /// Notification that the relay session for `client` was evicted.
    pub fn close(client: SocketAddr) -> Self {
        Message {
            kind: MessageKind::ConnectionClose,
            client,
            payload: Bytes::new(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Client key (address and port) this message is routed by.
    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Number of bytes `encode` will produce.
    pub fn encoded_len(&self) -> usize {
        let addr_len = match self.client.ip() {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        };
        1 + 1 + addr_len + 2 + self.payload.len()
    }

    /// Serializes the message.
    /// Format: [kind:1][family:1][ip:4|16][port:2 BE][payload:N]
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(self.payload.len()));
        }

        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind as u8);
        match self.client.ip() {
            IpAddr::V4(ipv4) => {
                dst.put_u8(FAMILY_V4);
                dst.put_slice(&ipv4.octets());
            }
            IpAddr::V6(ipv6) => {
                dst.put_u8(FAMILY_V6);
                dst.put_slice(&ipv6.octets());
            }
        }
        dst.put_u16(self.client.port());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Convenience wrapper around [`Message::encode`] returning a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Deserializes one message from exactly the bytes of its body.
    pub fn decode(mut src: Bytes) -> Result<Self, CodecError> {
        let total = src.len();
        if total < 2 {
            return Err(CodecError::Truncated(total));
        }

        let kind = MessageKind::try_from(src.get_u8())?;
        let ip = match src.get_u8() {
            FAMILY_V4 => {
                if src.remaining() < 4 + 2 {
                    return Err(CodecError::Truncated(total));
                }
                let mut octets = [0u8; 4];
                src.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            FAMILY_V6 => {
                if src.remaining() < 16 + 2 {
                    return Err(CodecError::Truncated(total));
                }
                let mut octets = [0u8; 16];
                src.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(CodecError::UnknownAddressFamily(other)),
        };
        let port = src.get_u16();

        // Whatever is left is the payload, shared with the receive buffer
        Message::new(kind, SocketAddr::new(ip, port), src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_client() -> SocketAddr {
        "203.0.113.5:40000".parse().unwrap()
    }

    #[test]
    fn test_wire_layout_ipv4() {
        let msg = Message::data("10.0.0.1:5000".parse().unwrap(), &b"ping"[..]).unwrap();
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(
            &bytes[..],
            &[0, 4, 10, 0, 0, 1, 0x13, 0x88, b'p', b'i', b'n', b'g'][..]
        );
    }

    #[test]
    fn test_wire_layout_ipv6_close() {
        let msg = Message::close("[2001:db8::1]:65535".parse().unwrap());
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes.len(), 1 + 1 + 16 + 2);
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[1], 6);
        assert_eq!(&bytes[2..4], &[0x20, 0x01]);
        assert_eq!(&bytes[18..20], &[0xff, 0xff]);
    }

    #[test]
    fn test_roundtrip_all_kinds_and_families() {
        let clients: [SocketAddr; 3] = [
            v4_client(),
            "0.0.0.0:0".parse().unwrap(),
            "[::1]:65535".parse().unwrap(),
        ];
        let kinds = [
            MessageKind::DataTransfer,
            MessageKind::ConnectionOpen,
            MessageKind::ConnectionClose,
        ];
        for client in clients {
            for kind in kinds {
                let msg = Message::new(kind, client, vec![0xab; 300]).unwrap();
                let decoded = Message::decode(msg.to_bytes().unwrap()).unwrap();
                assert_eq!(decoded, msg);
            }
        }
    }

    #[test]
    fn test_payload_size_boundary() {
        let max = Message::data(v4_client(), vec![0u8; MAX_PAYLOAD_LEN]).unwrap();
        let decoded = Message::decode(max.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.payload().len(), MAX_PAYLOAD_LEN);

        match Message::data(v4_client(), vec![0u8; MAX_PAYLOAD_LEN + 1]) {
            Err(CodecError::PayloadTooLarge(n)) => assert_eq!(n, MAX_PAYLOAD_LEN + 1),
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        let mut body = BytesMut::new();
        body.put_slice(&[0, 4, 127, 0, 0, 1, 0, 80]);
        body.put_slice(&vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            Message::decode(body.freeze()),
            Err(CodecError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let body = Bytes::from_static(&[3, 4, 127, 0, 0, 1, 0, 80]);
        assert!(matches!(
            Message::decode(body),
            Err(CodecError::UnknownKind(3))
        ));
    }

    #[test]
    fn test_decode_unknown_family() {
        let body = Bytes::from_static(&[0, 5, 127, 0, 0, 1, 0, 80]);
        assert!(matches!(
            Message::decode(body),
            Err(CodecError::UnknownAddressFamily(5))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            Message::decode(Bytes::from_static(&[0])),
            Err(CodecError::Truncated(1))
        ));
        assert!(matches!(
            Message::decode(Bytes::from_static(&[0, 4, 127, 0, 0])),
            Err(CodecError::Truncated(5))
        ));
        assert!(matches!(
            Message::decode(Bytes::from_static(&[1, 6, 0, 0, 0, 0])),
            Err(CodecError::Truncated(6))
        ));
    }

    #[test]
    fn test_empty_payload_and_zero_port() {
        let msg = Message::data("192.0.2.7:0".parse().unwrap(), Bytes::new()).unwrap();
        let decoded = Message::decode(msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.client().port(), 0);
        assert!(decoded.payload().is_empty());
    }
}
