//! Application messages.
//!
//! A [`Message`] is what modules send and broadcast. It is transport
//! neutral: on WebSocket sessions it maps to a [`Frame`], on TCP and UDP
//! sessions only its payload bytes go on the wire.
//!
//! # Message Types
//!
//! | Type | Description | Use Case |
//! |------|-------------|----------|
//! | [`MessageType::Text`] | UTF-8 text | JSON telemetry, commands |
//! | [`MessageType::Binary`] | Raw bytes | Register dumps, heartbeats |
//! | [`MessageType::Ping`] | Keep-alive request | WebSocket liveness checks |
//! | [`MessageType::Pong`] | Keep-alive response | Answering pings |
//! | [`MessageType::Close`] | Connection close | Graceful shutdown |
//!
//! # Examples
//!
//! ```
//! use gatesock_core::message::{Message, MessageType};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Reading {
//!     tag: String,
//!     value: f64,
//! }
//!
//! let msg = Message::text(r#"{"tag":"boiler.temp","value":81.5}"#);
//! assert_eq!(msg.message_type(), MessageType::Text);
//!
//! let reading: Reading = msg.json().unwrap();
//! assert_eq!(reading.tag, "boiler.temp");
//! ```

use crate::error::{Error, Result};
use crate::frame::{CloseCode, CloseFrame, Frame};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;

/// Represents the type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Binary,
    /// Ping with application data.
    Ping,
    /// Pong echoing a ping.
    Pong,
    /// Close request; the payload is the RFC 6455 close body (code + reason).
    Close,
}

/// A transport-neutral message.
///
/// `Message` is cheaply cloneable: the payload is reference counted, so a
/// broadcast shares one buffer across every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The raw message data.
    ///
    /// For text messages this is guaranteed to be valid UTF-8.
    pub data: Bytes,

    /// The type of this message.
    pub msg_type: MessageType,
}

impl Message {
    /// Creates a text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(text.into()),
            msg_type: MessageType::Text,
        }
    }

    /// Creates a binary message.
    ///
    /// # Examples
    ///
    /// ```
    /// use gatesock_core::message::Message;
    ///
    /// let msg = Message::binary(vec![0x01, 0x02, 0x03]);
    /// assert_eq!(msg.as_bytes(), &[1, 2, 3]);
    /// ```
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            msg_type: MessageType::Binary,
        }
    }

    /// Creates a ping message.
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            msg_type: MessageType::Ping,
        }
    }

    /// Creates a pong message.
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            msg_type: MessageType::Pong,
        }
    }

    /// Creates a close message without a status code.
    pub fn close() -> Self {
        Self {
            data: Bytes::new(),
            msg_type: MessageType::Close,
        }
    }

    /// Creates a close message with a status code and reason.
    pub fn close_with(code: CloseCode, reason: &str) -> Self {
        let mut data = BytesMut::with_capacity(2 + reason.len());
        data.put_u16(code.into());
        data.put_slice(reason.as_bytes());
        Self {
            data: data.freeze(),
            msg_type: MessageType::Close,
        }
    }

    /// Converts this message to a WebSocket frame.
    pub fn into_frame(self) -> Frame {
        match self.msg_type {
            MessageType::Text => Frame::Text(self.data),
            MessageType::Binary => Frame::Binary(self.data),
            MessageType::Ping => Frame::Ping(self.data),
            MessageType::Pong => Frame::Pong(self.data),
            MessageType::Close => Frame::Close(self.close_frame()),
        }
    }

    /// Creates a message from a WebSocket frame.
    ///
    /// Fragments are not messages; they are delivered through the
    /// fragment-stream callbacks instead and yield `None` here.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Text(data) => Some(Self {
                data,
                msg_type: MessageType::Text,
            }),
            Frame::Binary(data) => Some(Self::binary(data)),
            Frame::Ping(data) => Some(Self::ping(data)),
            Frame::Pong(data) => Some(Self::pong(data)),
            Frame::Close(None) => Some(Self::close()),
            Frame::Close(Some(close)) => Some(Self::close_with(close.code, &close.reason)),
            Frame::BinaryFragment { .. } => None,
        }
    }

    /// Status code and reason of a close message.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        if self.msg_type != MessageType::Close || self.data.len() < 2 {
            return None;
        }
        let code = CloseCode::from(u16::from_be_bytes([self.data[0], self.data[1]]));
        let reason = String::from_utf8_lossy(&self.data[2..]).into_owned();
        Some(CloseFrame::new(code, reason))
    }

    /// Returns the type of this message.
    pub fn message_type(&self) -> MessageType {
        self.msg_type
    }

    /// Checks if this is a text message.
    pub fn is_text(&self) -> bool {
        self.msg_type == MessageType::Text
    }

    /// Checks if this is a binary message.
    pub fn is_binary(&self) -> bool {
        self.msg_type == MessageType::Binary
    }

    /// Checks if this is a ping message.
    pub fn is_ping(&self) -> bool {
        self.msg_type == MessageType::Ping
    }

    /// Checks if this is a pong message.
    pub fn is_pong(&self) -> bool {
        self.msg_type == MessageType::Pong
    }

    /// Checks if this is a close message.
    pub fn is_close(&self) -> bool {
        self.msg_type == MessageType::Close
    }

    /// Text content, for text messages.
    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            std::str::from_utf8(&self.data).ok()
        } else {
            None
        }
    }

    /// Raw payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Parses a text message as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let text = self.as_text().ok_or(Error::InvalidMessage)?;
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message() {
        let msg = Message::text("Hello, gateway!");
        assert!(msg.is_text());
        assert_eq!(msg.as_text(), Some("Hello, gateway!"));
        assert_eq!(msg.message_type(), MessageType::Text);
    }

    #[test]
    fn test_binary_message() {
        let data = vec![1, 2, 3, 4, 5];
        let msg = Message::binary(data.clone());
        assert!(msg.is_binary());
        assert_eq!(msg.as_bytes(), &data[..]);
        assert_eq!(msg.as_text(), None);
    }

    #[test]
    fn test_control_messages() {
        assert!(Message::ping(Bytes::new()).is_ping());
        assert!(Message::pong(Bytes::new()).is_pong());
        assert!(Message::close().is_close());
        assert_eq!(Message::close().close_frame(), None);
    }

    #[test]
    fn test_close_with_code() {
        let msg = Message::close_with(CloseCode::Away, "restart");
        assert_eq!(&msg.as_bytes()[..2], &[0x03, 0xE9]);
        assert_eq!(
            msg.close_frame(),
            Some(CloseFrame::new(CloseCode::Away, "restart"))
        );
        assert_eq!(msg.into_frame(), Frame::close(CloseCode::Away, "restart"));
    }

    #[test]
    fn test_json_parsing() {
        let msg = Message::text(r#"{"key":"value","number":42}"#);
        let json: serde_json::Value = msg.json().unwrap();
        assert_eq!(json["key"], "value");
        assert_eq!(json["number"], 42);

        let err = Message::binary(vec![b'{', b'}']).json::<serde_json::Value>();
        assert!(matches!(err, Err(Error::InvalidMessage)));
    }

    #[test]
    fn test_frame_conversion() {
        for msg in [
            Message::text("test"),
            Message::binary(vec![9u8, 8]),
            Message::ping(vec![1u8]),
            Message::close_with(CloseCode::Normal, "done"),
        ] {
            let back = Message::from_frame(msg.clone().into_frame()).unwrap();
            assert_eq!(back, msg);
        }
        let fragment = Frame::fragment(crate::frame::FragmentPosition::First, vec![1u8]);
        assert!(Message::from_frame(fragment).is_none());
    }
}
