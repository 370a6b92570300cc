//! Opening handshake (RFC 6455 section 4)
//!
//! The server answers an HTTP/1.1 `GET` upgrade request with
//! `101 Switching Protocols`, proving it read the request by hashing the
//! client's `Sec-WebSocket-Key` together with a fixed GUID.

use base64::Engine;
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key before hashing
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors that can occur while parsing the upgrade request
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Not an HTTP GET upgrade request")]
    NotUpgradeRequest,

    #[error("Missing or empty Sec-WebSocket-Key header")]
    MissingKey,
}

/// The parts of an upgrade request the server needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
}

/// Whether the buffer starts with an HTTP `GET` request line
pub fn is_upgrade_request(buf: &[u8]) -> bool {
    buf.len() >= 3 && buf[..3].eq_ignore_ascii_case(b"GET")
}

/// Length of the request head (including the blank line) once it is fully buffered
pub fn request_head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Parse the request line and the `Sec-WebSocket-Key` header.
///
/// Header names are matched case-insensitively and values are trimmed.
pub fn parse_upgrade_request(head: &str) -> Result<UpgradeRequest, HandshakeError> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    match parts.next() {
        Some(method) if method.eq_ignore_ascii_case("GET") => {}
        _ => return Err(HandshakeError::NotUpgradeRequest),
    }
    let path = parts.next().unwrap_or("/").to_string();

    let key = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("Sec-WebSocket-Key"))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    Ok(UpgradeRequest { path, key })
}

/// Compute the `Sec-WebSocket-Accept` value for a client key
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Render the `101 Switching Protocols` response for a client key
pub fn switching_protocols_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
}
