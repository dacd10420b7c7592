//! HTTP upgrade handshake (RFC 6455 section 4).
//!
//! The request head is accumulated until [`find_terminator`] locates the
//! blank line, then parsed into an [`UpgradeRequest`]. Bytes that arrived
//! after the terminator belong to the frame stream and stay in the buffer.
//!
//! # Examples
//!
//! ```
//! use gatesock_core::handshake::{accept_key, find_terminator};
//!
//! let head = b"GET / HTTP/1.1\r\nHost: plc\r\n\r\n\x81\x80";
//! assert_eq!(find_terminator(head), Some(25));
//!
//! assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
//! ```

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, HeaderName, HeaderValue,
    SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION,
    UPGRADE,
};
use http::{Method, Request, Response, StatusCode, Uri};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Blank line ending an HTTP head.
pub const HEADER_TERMINATOR: &[u8; 4] = b"\r\n\r\n";

/// Default limit on the size of a request head.
pub const DEFAULT_MAX_HANDSHAKE_LEN: usize = 8 * 1024;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Index of the first `\r\n\r\n` in `window`.
///
/// Never looks past the end of the window. A terminator split across two
/// reads is found once the caller rescans the accumulated buffer.
pub fn find_terminator(window: &[u8]) -> Option<usize> {
    window
        .windows(HEADER_TERMINATOR.len())
        .position(|candidate| candidate == HEADER_TERMINATOR)
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

/// Reads from `stream` into `buf` until a full HTTP head is buffered.
///
/// Returns the head length including the terminator, or `None` once
/// `max_len` bytes were read without finding one.
pub async fn read_head<S>(stream: &mut S, buf: &mut BytesMut, max_len: usize) -> Result<Option<usize>>
where
    S: AsyncRead + Unpin,
{
    let mut scanned: usize = 0;
    loop {
        // Back up so a terminator straddling two reads is still seen.
        let from = scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
        if let Some(pos) = find_terminator(&buf[from..]) {
            let end = from + pos + HEADER_TERMINATOR.len();
            return Ok((end <= max_len).then_some(end));
        }
        if buf.len() >= max_len {
            return Ok(None);
        }
        scanned = buf.len();

        buf.reserve(1024);
        if stream.read_buf(buf).await? == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::handshake(format!("malformed header line {:?}", line)))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(Error::handshake)?;
        let value = HeaderValue::from_str(value.trim()).map_err(Error::handshake)?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

fn joined(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    (!values.is_empty()).then(|| values.join(", "))
}

fn head_text(head: &[u8]) -> Result<&str> {
    std::str::from_utf8(head).map_err(|_| Error::handshake("head is not valid UTF-8"))
}

fn serialize_head(start_line: &str, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(start_line.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn serialize_response(response: &Response<()>, body: &[u8]) -> Vec<u8> {
    let status = response.status();
    let start_line = format!(
        "HTTP/1.1 {} {}",
        status.as_str(),
        status.canonical_reason().unwrap_or_default()
    );
    serialize_head(&start_line, response.headers(), body)
}

/// A validated WebSocket upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request target
    pub uri: Uri,
    /// All request headers
    pub headers: HeaderMap,
    key: String,
}

impl UpgradeRequest {
    /// Parses and validates a request head (terminator included or not).
    pub fn parse(head: &[u8]) -> Result<Self> {
        let mut lines = head_text(head)?.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(version), None) => (method, target, version),
            _ => {
                return Err(Error::handshake(format!(
                    "malformed request line {:?}",
                    request_line
                )));
            }
        };

        if Method::from_bytes(method.as_bytes()).map_err(Error::handshake)? != Method::GET {
            return Err(Error::handshake(format!("unsupported method {}", method)));
        }
        if version != "HTTP/1.1" {
            return Err(Error::handshake(format!("unsupported version {}", version)));
        }
        let uri: Uri = target.parse().map_err(Error::handshake)?;
        let headers = parse_headers(lines)?;

        if !has_token(&headers, &UPGRADE, "websocket") {
            return Err(Error::handshake("missing Upgrade: websocket"));
        }
        if !has_token(&headers, &CONNECTION, "upgrade") {
            return Err(Error::handshake("missing Connection: Upgrade"));
        }
        if headers.get(SEC_WEBSOCKET_VERSION).map(HeaderValue::as_bytes) != Some(&b"13"[..]) {
            return Err(Error::handshake("unsupported Sec-WebSocket-Version"));
        }
        let key = headers
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .ok_or_else(|| Error::handshake("missing Sec-WebSocket-Key"))?;
        match STANDARD.decode(key) {
            Ok(nonce) if nonce.len() == 16 => {}
            _ => return Err(Error::handshake("malformed Sec-WebSocket-Key")),
        }

        Ok(Self {
            key: key.to_string(),
            uri,
            headers,
        })
    }

    /// Request path.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Client nonce.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// All `Sec-WebSocket-Extensions` values joined into one offer list.
    pub fn extensions(&self) -> Option<String> {
        joined(&self.headers, &SEC_WEBSOCKET_EXTENSIONS)
    }

    /// `101 Switching Protocols` response bytes.
    pub fn response_bytes(&self, extensions: Option<&str>) -> Result<Vec<u8>> {
        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_ACCEPT, accept_key(&self.key));
        if let Some(extensions) = extensions {
            builder = builder.header(SEC_WEBSOCKET_EXTENSIONS, extensions);
        }
        let response = builder.body(()).map_err(Error::handshake)?;
        Ok(serialize_response(&response, &[]))
    }
}

/// Plain-text error response that ends the connection.
pub fn reject_bytes(status: StatusCode, reason: &str) -> Vec<u8> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(reason.len()));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    let start_line = format!(
        "HTTP/1.1 {} {}",
        status.as_str(),
        status.canonical_reason().unwrap_or_default()
    );
    serialize_head(&start_line, &headers, reason.as_bytes())
}

/// Client side of the upgrade.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key: String,
    request: Request<()>,
}

impl ClientHandshake {
    /// Builds a request for `path` on `host` with a fresh nonce.
    pub fn new(host: &str, path: &str, extensions: Option<&str>) -> Result<Self> {
        let key = STANDARD.encode(rand::random::<[u8; 16]>());
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, host)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_KEY, key.as_str())
            .header(SEC_WEBSOCKET_VERSION, "13");
        if let Some(extensions) = extensions {
            builder = builder.header(SEC_WEBSOCKET_EXTENSIONS, extensions);
        }
        let request = builder.body(()).map_err(Error::handshake)?;
        Ok(Self { key, request })
    }

    /// Nonce sent in `Sec-WebSocket-Key`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Request head bytes.
    pub fn request_bytes(&self) -> Vec<u8> {
        let target = self
            .request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        serialize_head(&format!("GET {} HTTP/1.1", target), self.request.headers(), &[])
    }

    /// Validates the server's response head.
    ///
    /// Returns the `Sec-WebSocket-Extensions` value the server selected.
    pub fn verify_response(&self, head: &[u8]) -> Result<Option<String>> {
        let mut lines = head_text(head)?.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        if parts.next() != Some("HTTP/1.1") {
            return Err(Error::handshake(format!("malformed status line {:?}", status_line)));
        }
        let status = parts
            .next()
            .map(|code| StatusCode::from_bytes(code.as_bytes()))
            .transpose()
            .map_err(Error::handshake)?;
        if status != Some(StatusCode::SWITCHING_PROTOCOLS) {
            return Err(Error::handshake(format!("server refused upgrade: {}", status_line)));
        }

        let headers = parse_headers(lines)?;
        if !has_token(&headers, &UPGRADE, "websocket") || !has_token(&headers, &CONNECTION, "upgrade") {
            return Err(Error::handshake("response is not a WebSocket upgrade"));
        }
        let expected = accept_key(&self.key);
        if headers.get(SEC_WEBSOCKET_ACCEPT).map(HeaderValue::as_bytes) != Some(expected.as_bytes()) {
            return Err(Error::handshake("Sec-WebSocket-Accept mismatch"));
        }
        Ok(joined(&headers, &SEC_WEBSOCKET_EXTENSIONS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const REQUEST: &str = "GET /telemetry?line=3 HTTP/1.1\r\n\
        Host: gateway.local\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Extensions: permessage-deflate\r\n\
        Sec-WebSocket-Extensions: x-custom; level=2\r\n\r\n";

    #[test]
    fn test_find_terminator() {
        assert_eq!(find_terminator(b""), None);
        assert_eq!(find_terminator(b"\r\n\r"), None);
        assert_eq!(find_terminator(b"\r\n\r\n"), Some(0));
        assert_eq!(find_terminator(b"GET / HTTP/1.1\r\n\r\n"), Some(14));
        assert_eq!(find_terminator(b"a\r\n\r\nb\r\n\r\n"), Some(1));
        // Bounded by the window even if the terminator follows.
        let buffer = b"Host: x\r\n\r\n";
        assert_eq!(find_terminator(&buffer[..10]), None);
    }

    #[test]
    fn test_rfc_accept_key() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_upgrade_request() {
        let request = UpgradeRequest::parse(REQUEST.as_bytes()).unwrap();
        assert_eq!(request.path(), "/telemetry");
        assert_eq!(request.key(), "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(
            request.extensions().as_deref(),
            Some("permessage-deflate, x-custom; level=2")
        );
    }

    #[test]
    fn test_rejects_incomplete_upgrades() {
        for (from, to) in [
            ("GET ", "POST "),
            ("HTTP/1.1\r\nHost", "HTTP/1.0\r\nHost"),
            ("Upgrade: websocket", "Upgrade: h2c"),
            ("keep-alive, Upgrade", "keep-alive"),
            ("Version: 13", "Version: 8"),
            ("dGhlIHNhbXBsZSBub25jZQ==", "c2hvcnQ="),
        ] {
            let head = REQUEST.replacen(from, to, 1);
            assert!(UpgradeRequest::parse(head.as_bytes()).is_err(), "accepted {}", to);
        }
    }

    #[test]
    fn test_response_bytes() {
        let request = UpgradeRequest::parse(REQUEST.as_bytes()).unwrap();
        let response = String::from_utf8(request.response_bytes(Some("permessage-deflate")).unwrap()).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains("sec-websocket-extensions: permessage-deflate\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_reject_bytes() {
        let response = String::from_utf8(reject_bytes(
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            "too large",
        ))
        .unwrap();
        assert!(response.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
        assert!(response.contains("content-length: 9\r\n"));
        assert!(response.ends_with("\r\n\r\ntoo large"));
    }

    #[test]
    fn test_client_round_trip() {
        let client = ClientHandshake::new("gateway.local:9000", "/line/3", Some("permessage-deflate")).unwrap();
        let request_bytes = client.request_bytes();
        let request = UpgradeRequest::parse(&request_bytes).unwrap();
        assert_eq!(request.path(), "/line/3");
        assert_eq!(request.key(), client.key());

        let response = request.response_bytes(Some("permessage-deflate")).unwrap();
        let selected = client.verify_response(&response).unwrap();
        assert_eq!(selected.as_deref(), Some("permessage-deflate"));
    }

    #[test]
    fn test_client_rejects_bad_responses() {
        let client = ClientHandshake::new("h", "/", None).unwrap();
        let other = ClientHandshake::new("h", "/", None).unwrap();
        let request = UpgradeRequest::parse(&other.request_bytes()).unwrap();
        // Accept computed for a different nonce.
        let response = request.response_bytes(None).unwrap();
        assert!(client.verify_response(&response).is_err());

        let refused = reject_bytes(StatusCode::BAD_REQUEST, "no");
        assert!(client.verify_response(&refused).is_err());
    }

    #[tokio::test]
    async fn test_read_head_across_reads() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tokio::spawn(async move {
            for chunk in [&b"GET / HTTP/1.1\r\nHost: a\r\n\r"[..], b"\n\x81\x00"] {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut buf = BytesMut::new();
        let end = read_head(&mut rx, &mut buf, 1024).await.unwrap().unwrap();
        assert_eq!(&buf[end - 4..end], HEADER_TERMINATOR);
        assert_eq!(end, "GET / HTTP/1.1\r\nHost: a\r\n\r\n".len());
    }

    #[tokio::test]
    async fn test_read_head_limit() {
        let mut source: &[u8] = &[b'x'; 4096];
        let mut buf = BytesMut::new();
        assert_eq!(read_head(&mut source, &mut buf, 512).await.unwrap(), None);

        let mut eof: &[u8] = b"GET / HTTP/1.1\r\n";
        let mut buf = BytesMut::new();
        assert!(read_head(&mut eof, &mut buf, 512).await.is_err());
    }
}
