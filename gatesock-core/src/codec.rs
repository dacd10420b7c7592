//! Stream codec for WebSocket frames.
//!
//! [`FrameCodec`] plugs the stateless [`Codec`] into
//! [`tokio_util::codec::Framed`]: it accumulates partial reads, tracks the
//! open fragmentation stream and yields typed [`Frame`]s.

use crate::error::{Error, ProtocolError, Result};
use crate::frame::{Codec, Frame, OpCode};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on buffer growth per incomplete decode.
const MAX_RESERVE: usize = 64 * 1024;

/// Frame decoder/encoder for one connection.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    codec: Codec,
    fragment_open: bool,
}

impl FrameCodec {
    /// Wraps a configured codec.
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            fragment_open: false,
        }
    }

    /// Underlying stateless codec.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Whether a fragmented message is in progress on the inbound side.
    pub fn fragment_open(&self) -> bool {
        self.fragment_open
    }

    fn check_fragmentation(&self, opcode: OpCode) -> Result<()> {
        match opcode {
            OpCode::Continuation if !self.fragment_open => {
                Err(ProtocolError::UnexpectedContinuation.into())
            }
            OpCode::Text | OpCode::Binary if self.fragment_open => {
                Err(ProtocolError::InterruptedFragmentStream.into())
            }
            _ => Ok(()),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some((header, header_len)) = self.codec.try_decode_frame_header(src)? else {
            return Ok(None);
        };

        let frame_len = usize::try_from(header.payload_len)
            .ok()
            .and_then(|len| len.checked_add(header_len))
            .ok_or(ProtocolError::PayloadTooLarge {
                len: header.payload_len,
                max: usize::MAX as u64,
            })?;
        if src.len() < frame_len {
            src.reserve((frame_len - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        self.check_fragmentation(header.opcode)?;
        let Some(payload) = self.codec.decode_payload(&header, &src[header_len..frame_len])? else {
            return Ok(None);
        };
        src.advance(frame_len);

        if header.opcode.is_data() {
            self.fragment_open = !header.fin;
        }
        Codec::frame_from_parts(&header, payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        self.codec.encode_frame_into(&frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CloseCode, FragmentPosition, Role};
    use bytes::Bytes;

    fn client_wire(frames: &[Frame]) -> BytesMut {
        let mut encoder = FrameCodec::new(Codec::new(Role::Client));
        let mut wire = BytesMut::new();
        for frame in frames {
            encoder.encode(frame.clone(), &mut wire).unwrap();
        }
        wire
    }

    fn decode_all(decoder: &mut FrameCodec, wire: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(wire).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decodes_back_to_back_frames() {
        let frames = vec![
            Frame::text("one"),
            Frame::binary(vec![2u8; 500]),
            Frame::Ping(Bytes::from_static(b"p")),
            Frame::close(CloseCode::Normal, ""),
        ];
        let mut wire = client_wire(&frames);
        let mut server = FrameCodec::new(Codec::new(Role::Server));
        assert_eq!(decode_all(&mut server, &mut wire), frames);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let frames = vec![Frame::text("split across reads"), Frame::binary(vec![1u8; 300])];
        let wire = client_wire(&frames);
        let mut server = FrameCodec::new(Codec::new(Role::Server));
        let mut buffer = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            buffer.extend_from_slice(&[*byte]);
            if let Some(frame) = server.decode(&mut buffer).unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_fragment_stream_tracking() {
        let frames = vec![
            Frame::fragment(FragmentPosition::First, vec![1u8]),
            Frame::Ping(Bytes::new()),
            Frame::fragment(FragmentPosition::Middle, vec![2u8]),
            Frame::fragment(FragmentPosition::Last, vec![3u8]),
            Frame::text("after"),
        ];
        let mut wire = client_wire(&frames);
        let mut server = FrameCodec::new(Codec::new(Role::Server));

        let first = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(first, frames[0]);
        assert!(server.fragment_open());

        let rest = decode_all(&mut server, &mut wire);
        assert_eq!(rest, frames[1..].to_vec());
        assert!(!server.fragment_open());
    }

    #[test]
    fn test_continuation_without_stream_is_rejected() {
        let mut wire = client_wire(&[Frame::fragment(FragmentPosition::Last, vec![1u8])]);
        let mut server = FrameCodec::new(Codec::new(Role::Server));
        let err = server.decode(&mut wire).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedContinuation)));
    }

    #[test]
    fn test_new_message_inside_stream_is_rejected() {
        let mut wire = client_wire(&[
            Frame::fragment(FragmentPosition::First, vec![1u8]),
            Frame::binary(vec![2u8]),
        ]);
        let mut server = FrameCodec::new(Codec::new(Role::Server));
        server.decode(&mut wire).unwrap();
        let err = server.decode(&mut wire).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InterruptedFragmentStream)));
    }

    #[test]
    fn test_huge_declared_length_does_not_panic() {
        let mut server = FrameCodec::new(Codec::new(Role::Server).with_max_payload_len(u64::MAX));

        let mut wire = BytesMut::from(&[0x82u8, 0xFF][..]);
        wire.extend_from_slice(&u64::MAX.to_be_bytes());
        wire.extend_from_slice(&[0, 0, 0, 0]);
        let err = server.decode(&mut wire).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidPayloadLength(_))));

        // Largest legal length: waits for more data without allocating it all.
        let mut wire = BytesMut::from(&[0x82u8, 0xFF][..]);
        wire.extend_from_slice(&(i64::MAX as u64).to_be_bytes());
        wire.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(server.decode(&mut wire).unwrap(), None);
        assert!(wire.capacity() < 1 << 20);
    }

    #[test]
    fn test_server_to_client_direction() {
        let mut server = FrameCodec::new(Codec::new(Role::Server));
        let mut wire = BytesMut::new();
        server.encode(Frame::text("down"), &mut wire).unwrap();
        let mut client = FrameCodec::new(Codec::new(Role::Client));
        assert_eq!(client.decode(&mut wire).unwrap(), Some(Frame::text("down")));
    }
}
