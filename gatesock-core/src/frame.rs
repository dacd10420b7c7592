//! WebSocket frame encoding and decoding (RFC 6455 section 5).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! [`Codec`] is stateless apart from its immutable configuration (role,
//! negotiated [`ExtensionChain`], payload limit) and can be shared freely
//! between tasks. Fragmentation-stream tracking lives in
//! [`FrameCodec`](crate::codec::FrameCodec).
//!
//! # Examples
//!
//! ```
//! use gatesock_core::frame::{Codec, Frame, Role};
//!
//! let client = Codec::new(Role::Client);
//! let server = Codec::new(Role::Server);
//!
//! let wire = client.encode_frame(&Frame::text("hello")).unwrap();
//! let (header, header_len) = server.try_decode_frame_header(&wire).unwrap().unwrap();
//! assert!(header.masked);
//!
//! let payload = server.decode_payload(&header, &wire[header_len..]).unwrap().unwrap();
//! assert_eq!(Codec::frame_from_parts(&header, payload).unwrap(), Frame::text("hello"));
//! ```

use crate::error::{ProtocolError, Result};
use crate::extension::{ExtensionChain, Rsv};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Default limit on a single frame's declared payload length (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD_LEN: u64 = 125;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continues a fragmented message
    Continuation = 0x0,
    /// UTF-8 text
    Text = 0x1,
    /// Arbitrary bytes
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Keep-alive request
    Ping = 0x9,
    /// Keep-alive response
    Pong = 0xA,
}

impl OpCode {
    /// Parses the low nibble of the first header byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }

    /// Continuation, Text and Binary.
    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

/// Status code carried by a close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001, endpoint going away
    Away,
    /// 1002
    Protocol,
    /// 1003, data type not accepted
    Unsupported,
    /// 1005, no code present; never sent on the wire
    Status,
    /// 1006, abnormal closure; never sent on the wire
    Abnormal,
    /// 1007, inconsistent payload data
    InvalidPayload,
    /// 1008
    Policy,
    /// 1009, message too big
    TooBig,
    /// 1010, client expected an extension
    Extension,
    /// 1011, unexpected server condition
    Internal,
    /// Any other code
    Other(u16),
}

impl CloseCode {
    /// Whether a peer may put this code in a close frame.
    pub fn is_allowed_on_wire(self) -> bool {
        match self {
            CloseCode::Status | CloseCode::Abnormal => false,
            CloseCode::Other(code) => (3000..5000).contains(&code),
            _ => true,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::Policy,
            1009 => CloseCode::TooBig,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Internal,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::Policy => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Internal => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Payload of a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code
    pub code: CloseCode,
    /// UTF-8 reason, at most 123 bytes on the wire
    pub reason: String,
}

impl CloseFrame {
    /// Creates a close payload.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Where a frame sits inside a fragmentation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentPosition {
    /// Opening frame (data opcode, FIN clear)
    First,
    /// Continuation with FIN clear
    Middle,
    /// Continuation with FIN set
    Last,
}

/// Typed WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Ping with application data
    Ping(Bytes),
    /// Pong echoing ping data
    Pong(Bytes),
    /// Close with optional status
    Close(Option<CloseFrame>),
    /// Complete UTF-8 message; the bytes are guaranteed valid UTF-8
    Text(Bytes),
    /// Complete binary message
    Binary(Bytes),
    /// One frame of a fragmented message
    BinaryFragment {
        /// Position inside the stream
        position: FragmentPosition,
        /// Frame payload
        payload: Bytes,
    },
}

impl Frame {
    /// Text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(Bytes::from(text.into()))
    }

    /// Binary frame.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Frame::Binary(data.into())
    }

    /// Close frame with a status code and reason.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Frame::Close(Some(CloseFrame::new(code, reason)))
    }

    /// Fragment of a binary message.
    pub fn fragment(position: FragmentPosition, payload: impl Into<Bytes>) -> Self {
        Frame::BinaryFragment {
            position,
            payload: payload.into(),
        }
    }

    /// Opcode and FIN bit this frame is sent with.
    pub fn opcode_and_fin(&self) -> (OpCode, bool) {
        match self {
            Frame::Ping(_) => (OpCode::Ping, true),
            Frame::Pong(_) => (OpCode::Pong, true),
            Frame::Close(_) => (OpCode::Close, true),
            Frame::Text(_) => (OpCode::Text, true),
            Frame::Binary(_) => (OpCode::Binary, true),
            Frame::BinaryFragment { position, .. } => match position {
                FragmentPosition::First => (OpCode::Binary, false),
                FragmentPosition::Middle => (OpCode::Continuation, false),
                FragmentPosition::Last => (OpCode::Continuation, true),
            },
        }
    }

    /// Text payload, for text frames.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    fn payload_bytes(&self) -> Bytes {
        match self {
            Frame::Ping(data) | Frame::Pong(data) | Frame::Text(data) | Frame::Binary(data) => {
                data.clone()
            }
            Frame::BinaryFragment { payload, .. } => payload.clone(),
            Frame::Close(None) => Bytes::new(),
            Frame::Close(Some(close)) => {
                let mut buf = BytesMut::with_capacity(2 + close.reason.len());
                buf.put_u16(close.code.into());
                buf.put_slice(close.reason.as_bytes());
                buf.freeze()
            }
        }
    }
}

/// Which side of the connection a codec speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepts connections; receives masked frames, sends unmasked
    Server,
    /// Initiates connections; masks every frame it sends
    Client,
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1..RSV3
    pub rsv: Rsv,
    /// Frame opcode
    pub opcode: OpCode,
    /// Whether a masking key follows the length
    pub masked: bool,
    /// Declared payload length
    pub payload_len: u64,
    /// Masking key, when masked
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Number of bytes this header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        2 + length_extension_len(self.payload_len) + if self.masked { 4 } else { 0 }
    }

    fn write(&self, dst: &mut BytesMut) {
        let mut b0 = self.rsv.bits() << 4 | self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        let mask_bit = if self.masked { 0x80 } else { 0 };

        dst.put_u8(b0);
        match self.payload_len {
            len @ 0..=125 => dst.put_u8(mask_bit | len as u8),
            len @ 126..=0xFFFF => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(len as u16);
            }
            len => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(len);
            }
        }
        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}

fn length_extension_len(payload_len: u64) -> usize {
    match payload_len {
        0..=125 => 0,
        126..=0xFFFF => 2,
        _ => 8,
    }
}

/// XORs `buf` with the repeating masking key.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Stateless frame encoder/decoder bound to a role and extension chain.
#[derive(Debug, Clone)]
pub struct Codec {
    role: Role,
    extensions: ExtensionChain,
    max_payload_len: u64,
}

impl Codec {
    /// Codec with no extensions and the default payload limit.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            extensions: ExtensionChain::default(),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }

    /// Installs the chain negotiated during the handshake.
    pub fn with_extensions(mut self, extensions: ExtensionChain) -> Self {
        self.extensions = extensions;
        self
    }

    /// Sets the largest payload length accepted from the peer.
    pub fn with_max_payload_len(mut self, max_payload_len: u64) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    /// Role this codec speaks for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated extensions, in negotiation order.
    pub fn extensions(&self) -> &ExtensionChain {
        &self.extensions
    }

    /// Configured payload limit.
    pub fn max_payload_len(&self) -> u64 {
        self.max_payload_len
    }

    /// Encodes `frame` into a fresh buffer.
    pub fn encode_frame(&self, frame: &Frame) -> Result<BytesMut> {
        let mut dst = BytesMut::new();
        self.encode_frame_into(frame, &mut dst)?;
        Ok(dst)
    }

    /// Encodes `frame`, appending the wire bytes to `dst`.
    ///
    /// Data frames pass through every extension in negotiation order; each
    /// extension that flags the payload gets its RSV bits set. Client frames
    /// are masked with a fresh random key.
    pub fn encode_frame_into(&self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        let (opcode, fin) = frame.opcode_and_fin();
        let mut rsv = Rsv::empty();

        let payload = if opcode.is_data() && !self.extensions.is_empty() {
            let mut payload = frame.payload_bytes().to_vec();
            for extension in self.extensions.iter() {
                let (transformed, flagged) = extension.encode(opcode, fin, payload)?;
                payload = transformed;
                if flagged {
                    rsv |= extension.rsv();
                }
            }
            Bytes::from(payload)
        } else {
            frame.payload_bytes()
        };

        let mask = match self.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        let header = FrameHeader {
            fin,
            rsv,
            opcode,
            masked: mask.is_some(),
            payload_len: payload.len() as u64,
            mask,
        };

        dst.reserve(header.encoded_len() + payload.len());
        header.write(dst);
        match mask {
            Some(mask) => {
                let start = dst.len();
                dst.put_slice(&payload);
                apply_mask(&mut dst[start..], mask);
            }
            None => dst.put_slice(&payload),
        }
        Ok(())
    }

    /// Decodes a frame header from the start of `window`.
    ///
    /// Returns `Ok(None)` when `window` is shorter than the header it
    /// announces; nothing is validated until the full header is present and
    /// nothing past `window` is read. On success returns the header and its
    /// length in bytes.
    pub fn try_decode_frame_header(&self, window: &[u8]) -> Result<Option<(FrameHeader, usize)>> {
        if window.len() < 2 {
            return Ok(None);
        }
        let (b0, b1) = (window[0], window[1]);
        let masked = b1 & 0x80 != 0;
        let len7 = b1 & 0x7F;
        let extension_len = match len7 {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask_offset = 2 + extension_len;
        let header_len = mask_offset + if masked { 4 } else { 0 };
        if window.len() < header_len {
            return Ok(None);
        }

        let payload_len = match extension_len {
            2 => u64::from(u16::from_be_bytes([window[2], window[3]])),
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&window[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(ProtocolError::InvalidPayloadLength(len).into());
                }
                len
            }
            _ => u64::from(len7),
        };

        let fin = b0 & 0x80 != 0;
        let rsv = Rsv::from_bits_retain((b0 >> 4) & 0x07);
        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(ProtocolError::UnknownOpcode(b0 & 0x0F))?;

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControlFrame.into());
            }
            if payload_len > MAX_CONTROL_PAYLOAD_LEN {
                return Err(ProtocolError::ControlFrameTooLarge(payload_len).into());
            }
        }
        if payload_len > self.max_payload_len {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload_len,
            }
            .into());
        }

        let expect_masked = self.role == Role::Server;
        if masked != expect_masked {
            return Err(ProtocolError::MaskMismatch {
                expected: expect_masked,
            }
            .into());
        }

        self.check_rsv(opcode, rsv)?;

        let mask = masked.then(|| {
            let mut key = [0u8; 4];
            key.copy_from_slice(&window[mask_offset..mask_offset + 4]);
            key
        });

        Ok(Some((
            FrameHeader {
                fin,
                rsv,
                opcode,
                masked,
                payload_len,
                mask,
            },
            header_len,
        )))
    }

    /// Decodes the payload that follows `header`.
    ///
    /// `window` starts right after the header. Returns `Ok(None)` while the
    /// payload is incomplete. The payload is unmasked, then every extension's
    /// incoming transform runs in reverse negotiation order.
    pub fn decode_payload(&self, header: &FrameHeader, window: &[u8]) -> Result<Option<Bytes>> {
        self.check_rsv(header.opcode, header.rsv)?;

        let len = usize::try_from(header.payload_len).map_err(|_| ProtocolError::PayloadTooLarge {
            len: header.payload_len,
            max: self.max_payload_len,
        })?;
        let Some(raw) = window.get(..len) else {
            return Ok(None);
        };

        let mut payload = raw.to_vec();
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        if header.opcode.is_data() {
            for extension in self.extensions.iter().rev() {
                let flagged = header.rsv.intersects(extension.rsv());
                payload = extension.decode(header.opcode, header.fin, flagged, payload)?;
            }
        }

        Ok(Some(Bytes::from(payload)))
    }

    /// Maps a decoded header and payload to a typed frame.
    ///
    /// Text payloads are validated as UTF-8 and close payloads are parsed.
    /// Fragmented text messages surface as binary fragment streams.
    pub fn frame_from_parts(header: &FrameHeader, payload: Bytes) -> Result<Frame> {
        let frame = match (header.opcode, header.fin) {
            (OpCode::Ping, _) => Frame::Ping(payload),
            (OpCode::Pong, _) => Frame::Pong(payload),
            (OpCode::Close, _) => Frame::Close(parse_close_payload(&payload)?),
            (OpCode::Text, true) => {
                std::str::from_utf8(&payload).map_err(|_| ProtocolError::InvalidUtf8)?;
                Frame::Text(payload)
            }
            (OpCode::Binary, true) => Frame::Binary(payload),
            (OpCode::Text | OpCode::Binary, false) => Frame::fragment(FragmentPosition::First, payload),
            (OpCode::Continuation, false) => Frame::fragment(FragmentPosition::Middle, payload),
            (OpCode::Continuation, true) => Frame::fragment(FragmentPosition::Last, payload),
        };
        Ok(frame)
    }

    fn check_rsv(&self, opcode: OpCode, rsv: Rsv) -> Result<()> {
        let allowed = if opcode.is_data() {
            self.extensions.claimed_rsv()
        } else {
            Rsv::empty()
        };
        let unclaimed = rsv.difference(allowed);
        if unclaimed.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ReservedBits(unclaimed.bits()).into())
        }
    }
}

fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseFrame>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(ProtocolError::InvalidClosePayload.into()),
        _ => {
            let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
            if !code.is_allowed_on_wire() {
                return Err(ProtocolError::InvalidClosePayload.into());
            }
            let reason = std::str::from_utf8(&payload[2..]).map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(Some(CloseFrame::new(code, reason)))
        }
    }
}
