//! WebSocket extension negotiation and payload transforms.
//!
//! An [`Extension`] transforms data-frame payloads and owns zero or more RSV
//! bits. Extensions are produced by an [`ExtensionFactory`] during the
//! handshake and collected, in negotiation order, into an immutable
//! [`ExtensionChain`] that the [`Codec`](crate::frame::Codec) applies:
//!
//! - outgoing: `chain[0]`, `chain[1]`, ... then the wire
//! - incoming: the wire, then `chain[n-1]`, ..., `chain[0]`
//!
//! RSV ownership is exclusive. The [`ExtensionNegotiator`] rejects any offer
//! whose bits are already claimed by an earlier accepted extension, naming the
//! conflicting bit as the invalid parameter.
//!
//! # Examples
//!
//! ```
//! use gatesock_core::extension::{ExtensionNegotiator, PerMessageDeflateFactory};
//! use std::sync::Arc;
//!
//! let negotiator = ExtensionNegotiator::new()
//!     .with_factory(Arc::new(PerMessageDeflateFactory::default()));
//!
//! let outcome = negotiator
//!     .negotiate_server(Some("permessage-deflate; client_max_window_bits, x-unknown"))
//!     .unwrap();
//! assert_eq!(outcome.chain.len(), 1);
//! assert_eq!(
//!     outcome.response.as_deref(),
//!     Some("permessage-deflate; server_no_context_takeover; client_no_context_takeover")
//! );
//! ```

mod deflate;

pub use deflate::{PerMessageDeflate, PerMessageDeflateFactory};

use crate::error::{Error, Result};
use crate::frame::OpCode;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

bitflags! {
    /// The three reserved header bits, in their on-wire positions after `>> 4`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Rsv: u8 {
        /// RSV1 (0x40 in the first header byte)
        const RSV1 = 0b100;
        /// RSV2 (0x20 in the first header byte)
        const RSV2 = 0b010;
        /// RSV3 (0x10 in the first header byte)
        const RSV3 = 0b001;
    }
}

impl Rsv {
    /// Lower-case bit names joined by commas, e.g. `rsv1,rsv3`.
    pub fn label(self) -> String {
        [(Rsv::RSV1, "rsv1"), (Rsv::RSV2, "rsv2"), (Rsv::RSV3, "rsv3")]
            .into_iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A negotiated payload transformation.
///
/// Extensions only see data frames (text, binary, continuation). They must
/// be stateless or internally synchronized since one chain is shared by a
/// connection's reader and writer.
pub trait Extension: Send + Sync + fmt::Debug {
    /// Registered extension token, e.g. `permessage-deflate`.
    fn name(&self) -> &str;

    /// RSV bits this extension owns for the lifetime of the connection.
    fn rsv(&self) -> Rsv;

    /// Agreed parameters as they appear after the name in the header,
    /// without the leading `; `. Empty when there are none.
    fn params(&self) -> &str;

    /// Transforms an outgoing payload.
    ///
    /// Returns the new payload and whether the frame must carry this
    /// extension's RSV bits.
    fn encode(&self, opcode: OpCode, fin: bool, payload: Vec<u8>) -> Result<(Vec<u8>, bool)>;

    /// Reverses [`encode`](Extension::encode) on an incoming payload.
    ///
    /// `flagged` tells whether the frame carried this extension's RSV bits.
    fn decode(&self, opcode: OpCode, fin: bool, flagged: bool, payload: Vec<u8>) -> Result<Vec<u8>>;
}

/// Immutable, ordered list of negotiated extensions.
#[derive(Clone)]
pub struct ExtensionChain {
    extensions: Arc<[Arc<dyn Extension>]>,
    claimed: Rsv,
}

impl ExtensionChain {
    /// Builds a chain, rejecting overlapping RSV claims.
    pub fn new(extensions: Vec<Arc<dyn Extension>>) -> Result<Self> {
        let mut claimed = Rsv::empty();
        for extension in &extensions {
            let overlap = claimed & extension.rsv();
            if !overlap.is_empty() {
                return Err(Error::handshake(format!(
                    "extension {} claims {} which is already owned",
                    extension.name(),
                    overlap.label()
                )));
            }
            claimed |= extension.rsv();
        }
        Ok(Self {
            extensions: extensions.into(),
            claimed,
        })
    }

    /// Extensions in negotiation order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<dyn Extension>> {
        self.extensions.iter()
    }

    /// Union of all owned RSV bits.
    pub fn claimed_rsv(&self) -> Rsv {
        self.claimed
    }

    /// Number of extensions.
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// Whether no extension was negotiated.
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Value for the `Sec-WebSocket-Extensions` response header.
    pub fn header_value(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let entries: Vec<String> = self
            .iter()
            .map(|e| {
                if e.params().is_empty() {
                    e.name().to_string()
                } else {
                    format!("{}; {}", e.name(), e.params())
                }
            })
            .collect();
        Some(entries.join(", "))
    }
}

impl Default for ExtensionChain {
    fn default() -> Self {
        Self {
            extensions: Arc::from(Vec::new()),
            claimed: Rsv::empty(),
        }
    }
}

impl fmt::Debug for ExtensionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|e| e.name()))
            .finish()
    }
}

/// One `name[=value]` parameter of an extension offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    /// Parameter name
    pub name: String,
    /// Value, unquoted
    pub value: Option<String>,
}

/// One entry of a `Sec-WebSocket-Extensions` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension token
    pub name: String,
    /// Parameters in header order
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    /// Offer without parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Appends a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.params.push(ExtensionParam {
            name: name.into(),
            value: value.map(str::to_string),
        });
        self
    }

    /// First parameter with the given name.
    pub fn param(&self, name: &str) -> Option<&ExtensionParam> {
        self.params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for param in &self.params {
            match &param.value {
                Some(value) if value.chars().all(is_token_char) => {
                    write!(f, "; {}={}", param.name, value)?
                }
                Some(value) => write!(f, "; {}=\"{}\"", param.name, value)?,
                None => write!(f, "; {}", param.name)?,
            }
        }
        Ok(())
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// Splits on `sep` except inside double quotes.
fn split_unquoted(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Parses a `Sec-WebSocket-Extensions` header value.
pub fn parse_offers(header: &str) -> Result<Vec<ExtensionOffer>> {
    let mut offers = Vec::new();
    for entry in split_unquoted(header, ',') {
        let mut pieces = split_unquoted(entry, ';').into_iter().map(str::trim);
        let name = pieces.next().unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        if !name.chars().all(is_token_char) {
            return Err(Error::handshake(format!("invalid extension token {:?}", name)));
        }

        let mut offer = ExtensionOffer::new(name);
        for piece in pieces {
            if piece.is_empty() {
                continue;
            }
            let (param, value) = match piece.split_once('=') {
                Some((param, value)) => {
                    let value = value.trim();
                    let value = value
                        .strip_prefix('"')
                        .and_then(|v| v.strip_suffix('"'))
                        .unwrap_or(value);
                    (param.trim(), Some(value))
                }
                None => (piece, None),
            };
            if param.is_empty() || !param.chars().all(is_token_char) {
                return Err(Error::handshake(format!(
                    "invalid parameter {:?} for extension {}",
                    piece, name
                )));
            }
            offer = offer.with_param(param, value);
        }
        offers.push(offer);
    }
    Ok(offers)
}

/// Outcome of negotiating a single offer.
///
/// A rejection is a normal handshake outcome, not an error.
#[derive(Debug, Clone)]
pub enum Negotiation {
    /// The offer was accepted with this instance.
    Accepted(Arc<dyn Extension>),
    /// The offer was declined.
    Rejected {
        /// First parameter that could not be satisfied, if any
        invalid_parameter: Option<String>,
    },
}

impl Negotiation {
    /// Rejection naming the offending parameter.
    pub fn invalid(parameter: impl Into<String>) -> Self {
        Negotiation::Rejected {
            invalid_parameter: Some(parameter.into()),
        }
    }

    /// Whether the offer was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Negotiation::Accepted(_))
    }
}

/// Capability to negotiate one extension type.
pub trait ExtensionFactory: Send + Sync {
    /// Extension token this factory handles.
    fn name(&self) -> &str;

    /// What a client puts in its request header.
    fn offer(&self) -> ExtensionOffer;

    /// Server side: accepts or declines a client offer.
    fn negotiate_as_server(&self, offer: &ExtensionOffer) -> Negotiation;

    /// Client side: accepts or declines the server's response entry.
    fn negotiate_as_client(&self, response: &ExtensionOffer) -> Negotiation;
}

/// A declined offer, reported for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Extension token
    pub name: String,
    /// First unsatisfiable parameter, or the conflicting RSV bit
    pub invalid_parameter: Option<String>,
}

/// Result of server-side negotiation.
#[derive(Debug, Clone, Default)]
pub struct ServerNegotiation {
    /// Accepted extensions in negotiation order
    pub chain: ExtensionChain,
    /// `Sec-WebSocket-Extensions` value to send back
    pub response: Option<String>,
    /// Declined offers for known extensions
    pub rejected: Vec<Rejection>,
}

/// Resolves extension offers against the configured factories.
#[derive(Clone, Default)]
pub struct ExtensionNegotiator {
    factories: Vec<Arc<dyn ExtensionFactory>>,
}

impl ExtensionNegotiator {
    /// Negotiator that accepts nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory. Offers are matched against factories by name.
    pub fn with_factory(mut self, factory: Arc<dyn ExtensionFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Whether no factory is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn factory(&self, name: &str) -> Option<&Arc<dyn ExtensionFactory>> {
        self.factories
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }

    /// Negotiates a client's offer list, in list order.
    ///
    /// Unknown extensions are ignored. Alternatives for an already accepted
    /// extension are skipped. An acceptance that would claim an RSV bit owned
    /// by an earlier extension is turned into a rejection naming that bit.
    pub fn negotiate_server(&self, offers: Option<&str>) -> Result<ServerNegotiation> {
        let offers = match offers {
            Some(header) => parse_offers(header)?,
            None => return Ok(ServerNegotiation::default()),
        };

        let mut accepted: Vec<Arc<dyn Extension>> = Vec::new();
        let mut claimed = Rsv::empty();
        let mut rejected = Vec::new();

        for offer in offers {
            if accepted.iter().any(|e| e.name().eq_ignore_ascii_case(&offer.name)) {
                continue;
            }
            let Some(factory) = self.factory(&offer.name) else {
                debug!("Ignoring unsupported extension offer: {}", offer.name);
                continue;
            };

            match claim(factory.negotiate_as_server(&offer), claimed) {
                Negotiation::Accepted(extension) => {
                    debug!("Accepted extension: {}", extension.name());
                    claimed |= extension.rsv();
                    accepted.push(extension);
                }
                Negotiation::Rejected { invalid_parameter } => {
                    warn!(
                        "Rejected extension offer {} (invalid parameter: {:?})",
                        offer.name, invalid_parameter
                    );
                    rejected.push(Rejection {
                        name: offer.name,
                        invalid_parameter,
                    });
                }
            }
        }

        let chain = ExtensionChain::new(accepted)?;
        Ok(ServerNegotiation {
            response: chain.header_value(),
            chain,
            rejected,
        })
    }

    /// Request header value offering every registered extension.
    pub fn offer_header(&self) -> Option<String> {
        if self.factories.is_empty() {
            return None;
        }
        let offers: Vec<String> = self.factories.iter().map(|f| f.offer().to_string()).collect();
        Some(offers.join(", "))
    }

    /// Validates the server's response and builds the client chain.
    ///
    /// Any extension the client did not offer, any duplicate, any declined
    /// parameter or any RSV conflict fails the handshake.
    pub fn negotiate_client(&self, response: Option<&str>) -> Result<ExtensionChain> {
        let Some(header) = response else {
            return Ok(ExtensionChain::default());
        };

        let mut accepted: Vec<Arc<dyn Extension>> = Vec::new();
        let mut claimed = Rsv::empty();
        for entry in parse_offers(header)? {
            let factory = self.factory(&entry.name).ok_or_else(|| {
                Error::handshake(format!("server selected unrequested extension {}", entry.name))
            })?;
            if accepted.iter().any(|e| e.name().eq_ignore_ascii_case(&entry.name)) {
                return Err(Error::handshake(format!(
                    "server selected extension {} twice",
                    entry.name
                )));
            }

            match claim(factory.negotiate_as_client(&entry), claimed) {
                Negotiation::Accepted(extension) => {
                    claimed |= extension.rsv();
                    accepted.push(extension);
                }
                Negotiation::Rejected { invalid_parameter } => {
                    return Err(Error::handshake(format!(
                        "cannot accept extension {} (invalid parameter: {})",
                        entry.name,
                        invalid_parameter.as_deref().unwrap_or("none")
                    )));
                }
            }
        }
        ExtensionChain::new(accepted)
    }
}

/// Downgrades an acceptance that overlaps already claimed bits.
fn claim(negotiation: Negotiation, claimed: Rsv) -> Negotiation {
    match negotiation {
        Negotiation::Accepted(extension) => {
            let overlap = claimed & extension.rsv();
            if overlap.is_empty() {
                Negotiation::Accepted(extension)
            } else {
                Negotiation::invalid(overlap.label())
            }
        }
        rejected => rejected,
    }
}
