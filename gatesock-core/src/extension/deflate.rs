//! `permessage-deflate` (RFC 7692), owning RSV1.
//!
//! Both directions run without context takeover: every message is
//! compressed and decompressed with a fresh raw-deflate stream, so one
//! instance can be shared by a connection's reader and writer without locks.
//! Only unfragmented messages are compressed; compressed fragment streams
//! from the peer are refused.

use super::{Extension, ExtensionFactory, ExtensionOffer, Negotiation, Rsv};
use crate::error::{ProtocolError, Result};
use crate::frame::OpCode;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::sync::Arc;

const NAME: &str = "permessage-deflate";
const TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const AGREED_PARAMS: &str = "server_no_context_takeover; client_no_context_takeover";

/// Negotiates [`PerMessageDeflate`].
#[derive(Debug, Clone)]
pub struct PerMessageDeflateFactory {
    level: Compression,
    max_message_size: usize,
}

impl PerMessageDeflateFactory {
    /// Factory with the given compression level (0-9) and inflated size limit.
    pub fn new(level: u32, max_message_size: usize) -> Self {
        Self {
            level: Compression::new(level.min(9)),
            max_message_size,
        }
    }

    fn instance(&self) -> Negotiation {
        Negotiation::Accepted(Arc::new(PerMessageDeflate {
            level: self.level,
            max_message_size: self.max_message_size,
        }))
    }
}

impl Default for PerMessageDeflateFactory {
    fn default() -> Self {
        Self::new(6, crate::frame::DEFAULT_MAX_PAYLOAD_LEN as usize)
    }
}

fn window_bits(value: Option<&str>) -> Option<u8> {
    value?.parse::<u8>().ok().filter(|bits| (8..=15).contains(bits))
}

fn check_duplicates(offer: &ExtensionOffer) -> Option<String> {
    offer.params.iter().enumerate().find_map(|(i, param)| {
        offer.params[..i]
            .iter()
            .any(|earlier| earlier.name.eq_ignore_ascii_case(&param.name))
            .then(|| param.name.clone())
    })
}

impl ExtensionFactory for PerMessageDeflateFactory {
    fn name(&self) -> &str {
        NAME
    }

    fn offer(&self) -> ExtensionOffer {
        ExtensionOffer::new(NAME)
            .with_param(SERVER_NO_CONTEXT_TAKEOVER, None)
            .with_param(CLIENT_NO_CONTEXT_TAKEOVER, None)
    }

    fn negotiate_as_server(&self, offer: &ExtensionOffer) -> Negotiation {
        if let Some(duplicate) = check_duplicates(offer) {
            return Negotiation::invalid(duplicate);
        }
        for param in &offer.params {
            let valid = match param.name.as_str() {
                SERVER_NO_CONTEXT_TAKEOVER | CLIENT_NO_CONTEXT_TAKEOVER => param.value.is_none(),
                // The outgoing stream always uses a 32K window.
                SERVER_MAX_WINDOW_BITS => window_bits(param.value.as_deref()) == Some(15),
                CLIENT_MAX_WINDOW_BITS => {
                    param.value.is_none() || window_bits(param.value.as_deref()).is_some()
                }
                _ => false,
            };
            if !valid {
                return Negotiation::invalid(param.name.clone());
            }
        }
        self.instance()
    }

    fn negotiate_as_client(&self, response: &ExtensionOffer) -> Negotiation {
        if let Some(duplicate) = check_duplicates(response) {
            return Negotiation::invalid(duplicate);
        }
        if response.param(SERVER_NO_CONTEXT_TAKEOVER).is_none() {
            return Negotiation::invalid(SERVER_NO_CONTEXT_TAKEOVER);
        }
        for param in &response.params {
            let valid = match param.name.as_str() {
                SERVER_NO_CONTEXT_TAKEOVER | CLIENT_NO_CONTEXT_TAKEOVER => param.value.is_none(),
                SERVER_MAX_WINDOW_BITS => window_bits(param.value.as_deref()).is_some(),
                CLIENT_MAX_WINDOW_BITS => window_bits(param.value.as_deref()) == Some(15),
                _ => false,
            };
            if !valid {
                return Negotiation::invalid(param.name.clone());
            }
        }
        self.instance()
    }
}

/// Negotiated `permessage-deflate` instance.
#[derive(Debug, Clone)]
pub struct PerMessageDeflate {
    level: Compression,
    max_message_size: usize,
}

impl PerMessageDeflate {
    fn failure(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::Extension {
            name: NAME.to_string(),
            reason: reason.into(),
        }
    }

    fn deflate(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut compressor = Compress::new(self.level, false);
        let mut output = Vec::with_capacity(input.len() / 2 + 64);
        loop {
            if output.capacity() - output.len() < 64 {
                output.reserve(input.len().max(64));
            }
            let consumed = compressor.total_in() as usize;
            compressor
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| self.failure(e.to_string()))?;
            if compressor.total_in() as usize == input.len() && output.len() < output.capacity() {
                break;
            }
        }
        if output.ends_with(&TRAILER) {
            output.truncate(output.len() - TRAILER.len());
        }
        Ok(output)
    }

    fn inflate(&self, mut input: Vec<u8>) -> Result<Vec<u8>> {
        input.extend_from_slice(&TRAILER);
        let mut decompressor = Decompress::new(false);
        let mut output = Vec::with_capacity(input.len().saturating_mul(2).max(64));
        loop {
            if output.capacity() - output.len() < 64 {
                output.reserve(output.capacity().max(256));
            }
            let (in_before, out_before) = (decompressor.total_in(), decompressor.total_out());
            let status = decompressor
                .decompress_vec(
                    &input[in_before as usize..],
                    &mut output,
                    FlushDecompress::Sync,
                )
                .map_err(|e| self.failure(e.to_string()))?;

            if output.len() > self.max_message_size {
                return Err(ProtocolError::PayloadTooLarge {
                    len: output.len() as u64,
                    max: self.max_message_size as u64,
                }
                .into());
            }
            let drained = decompressor.total_in() as usize == input.len();
            if status == Status::StreamEnd || (drained && output.len() < output.capacity()) {
                break;
            }
            if decompressor.total_in() == in_before && decompressor.total_out() == out_before {
                if drained {
                    break;
                }
                return Err(self.failure("deflate stream stalled").into());
            }
        }
        Ok(output)
    }
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        NAME
    }

    fn rsv(&self) -> Rsv {
        Rsv::RSV1
    }

    fn params(&self) -> &str {
        AGREED_PARAMS
    }

    fn encode(&self, opcode: OpCode, fin: bool, payload: Vec<u8>) -> Result<(Vec<u8>, bool)> {
        match opcode {
            OpCode::Text | OpCode::Binary if fin => Ok((self.deflate(&payload)?, true)),
            _ => Ok((payload, false)),
        }
    }

    fn decode(&self, opcode: OpCode, fin: bool, flagged: bool, payload: Vec<u8>) -> Result<Vec<u8>> {
        if !flagged {
            return Ok(payload);
        }
        if opcode == OpCode::Continuation {
            return Err(self.failure("RSV1 set on a continuation frame").into());
        }
        if !fin {
            return Err(self.failure("compressed fragmented messages are not supported").into());
        }
        self.inflate(payload)
    }
}
