use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{CodecError, Message, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};

/// Size of the big-endian length prefix in front of every message.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Prefixes an already-encoded message with its 2-byte big-endian length.
/// The prefix counts only `body`, never itself.
pub fn frame(body: &[u8]) -> Result<BytesMut, CodecError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    let mut dst = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    dst.put_u16(body.len() as u16);
    dst.put_slice(body);
    Ok(dst)
}

/// Length-prefixed message codec used on the tunnel byte stream.
///
/// Wire format:
/// ```text
/// +------------------+---------------------------------------------+
/// | Length (2 bytes  | Message                                     |
/// | big-endian u16)  | [kind:1][family:1][ip:4|16][port:2][payload] |
/// +------------------+---------------------------------------------+
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the length prefix before anything else
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[0], src[1]]) as usize;
        let total_len = LENGTH_PREFIX_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let body = src.split_to(length).freeze();
        Message::decode(body).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Message>::encode(self, &item, dst)
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Validate before the prefix goes out so a failure never leaves half a frame
        if item.payload().len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(item.payload().len()));
        }
        let length = item.encoded_len();
        if length > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(length));
        }
        dst.reserve(LENGTH_PREFIX_LEN + length);
        dst.put_u16(length as u16);
        item.encode(dst)
    }
}

/// Turns an append-only byte stream back into messages.
///
/// Bytes read from the socket go into [`Reassembler::buffer_mut`]; iterating
/// then yields every complete message currently buffered. Partial frames stay
/// in the buffer, so iteration returning `None` only means "feed me more".
///
/// Once a message fails to decode the stream is no longer delimited
/// correctly: the error is yielded once and the iterator stays empty.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: BytesMut,
    codec: FrameCodec,
    poisoned: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler {
            buf: BytesMut::with_capacity(64 * 1024),
            codec: FrameCodec,
            poisoned: false,
        }
    }

    /// Appends raw bytes received from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer to read into directly, e.g. with `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes buffered but not yet consumed as a full frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Iterator for Reassembler {
    type Item = Result<Message, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned {
            return None;
        }
        match self.codec.decode(&mut self.buf) {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(e) => {
                self.poisoned = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::net::SocketAddr;

    fn sample_messages() -> Vec<Message> {
        let v4: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::42]:53".parse().unwrap();
        vec![
            Message::data(v4, &b"ping"[..]).unwrap(),
            Message::open(v6),
            Message::data(v6, vec![7u8; 1500]).unwrap(),
            Message::close(v4),
            Message::data(v4, Vec::new()).unwrap(),
        ]
    }

    fn encode_stream(messages: &[Message]) -> BytesMut {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        for msg in messages {
            codec.encode(msg, &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn test_frame_prefix() {
        let framed = frame(b"abc").unwrap();
        assert_eq!(&framed[..], &[0, 3, b'a', b'b', b'c'][..]);
    }

    #[test]
    fn test_frame_size_boundary() {
        assert_eq!(frame(&vec![0u8; MAX_FRAME_LEN]).unwrap().len(), MAX_FRAME_LEN + 2);
        assert!(matches!(
            frame(&vec![0u8; MAX_FRAME_LEN + 1]),
            Err(CodecError::FrameTooLarge(n)) if n == MAX_FRAME_LEN + 1
        ));
    }

    #[test]
    fn test_encoder_matches_frame_of_encoded_message() {
        let msg = Message::data("203.0.113.5:40000".parse().unwrap(), &b"ping"[..]).unwrap();
        let mut buf = BytesMut::new();
        FrameCodec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(buf, frame(&msg.to_bytes().unwrap()).unwrap());
    }

    #[test]
    fn test_partial_frame() {
        let msg = Message::data("10.0.0.1:5000".parse().unwrap(), &b"hello"[..]).unwrap();
        let mut buf = encode_stream(std::slice::from_ref(&msg));
        let full_len = buf.len();
        let mut partial = buf.split_to(full_len / 2);

        let mut codec = FrameCodec;
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(msg));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_three_chunks_single_frame() {
        let msg = Message::data("203.0.113.5:40000".parse().unwrap(), &b"ping"[..]).unwrap();
        let stream = encode_stream(std::slice::from_ref(&msg));

        let mut reassembler = Reassembler::new();
        let mut decoded = Vec::new();
        for chunk in [&stream[..1], &stream[1..3], &stream[3..]] {
            reassembler.push(chunk);
            decoded.extend(reassembler.by_ref().map(Result::unwrap));
        }
        assert_eq!(decoded, vec![msg]);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_any_split_yields_same_sequence() {
        let messages = sample_messages();
        let stream = encode_stream(&messages);

        let mut whole = Reassembler::new();
        whole.push(&stream);
        let expected: Vec<Message> = whole.by_ref().map(Result::unwrap).collect();
        assert_eq!(expected, messages);

        for chunk_size in [1, 2, 3, 5, 7, 64, 1499, 4096] {
            let mut reassembler = Reassembler::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                reassembler.push(chunk);
                decoded.extend(reassembler.by_ref().map(Result::unwrap));
            }
            assert_eq!(decoded, messages, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_reassembler_poisoned_after_bad_frame() {
        let good = Message::open("10.0.0.1:5000".parse().unwrap());
        let mut stream = encode_stream(std::slice::from_ref(&good));
        stream.extend_from_slice(&frame(&[9, 4, 127, 0, 0, 1, 0, 1]).unwrap());
        stream.extend_from_slice(&encode_stream(std::slice::from_ref(&good)));

        let mut reassembler = Reassembler::new();
        reassembler.push(&stream);
        assert_eq!(reassembler.next().unwrap().unwrap().kind(), MessageKind::ConnectionOpen);
        assert!(matches!(
            reassembler.next(),
            Some(Err(CodecError::UnknownKind(9)))
        ));
        assert!(reassembler.next().is_none());
    }
}
