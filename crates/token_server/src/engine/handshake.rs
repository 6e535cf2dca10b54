//! WebSocket opening handshake.
//!
//! Reads the HTTP-style request off the raw stream, parses it into a
//! [`RequestHeader`], validates origin and protocol version, negotiates the
//! sub-protocol, synthesizes a session cookie when the client has none, and
//! produces the era-specific response bytes. A failed handshake never gets
//! a protocol-level response: the caller just closes the socket.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use sha1::{Digest as _, Sha1};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokamak_protocol::Draft;
use uuid::Uuid;

/// Name of the session-id cookie.
pub const SESSION_COOKIE: &str = "sid";

/// Sub-protocol prefix whose suffix names the wire format (e.g.
/// `tokamak.json` negotiates the `json` codec).
pub const SUB_PROTOCOL_PREFIX: &str = "tokamak.";

/// Largest handshake request we are willing to buffer.
const MAX_REQUEST_BYTES: usize = 16 * 1024;

/// GUID the modern accept key is derived with.
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol versions the modern era accepts.
const SUPPORTED_VERSIONS: [u16; 2] = [8, 13];
/// Version assumed when a modern client sends none.
const DEFAULT_HYBI_VERSION: u16 = 13;
/// Version recorded for legacy clients.
const DEFAULT_HIXIE_VERSION: u16 = 75;

/// Why a handshake was rejected. The client only ever observes the TCP
/// close; these reasons are for the server's own logs.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// No header terminator arrived within the connect timeout
    #[error("no handshake received")]
    NoHandshake,

    /// The request grew past the buffer cap without a terminator
    #[error("handshake request too large")]
    RequestTooLarge,

    /// The request was not a parseable upgrade request
    #[error("malformed handshake: {0}")]
    Malformed(String),

    /// The origin did not match the configured allow-list
    #[error("origin not allowed: {0}")]
    OriginRejected(String),

    /// The client requested a protocol version we do not speak
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
}

/// Parsed handshake request fields.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    /// Request path without the argument section
    pub path: String,
    /// Arguments embedded in the path after the `;` separator
    pub args: HashMap<String, String>,
    /// `Host` header
    pub host: Option<String>,
    /// `Origin` header
    pub origin: Option<String>,
    /// Cookies parsed with `; ` as pair separator and `=` within a pair
    pub cookies: HashMap<String, String>,
    /// Sub-protocol candidates in the order the client offered them
    pub sub_protocols: Vec<String>,
    /// Negotiated protocol era
    pub draft: Draft,
    /// Negotiated protocol version
    pub version: u16,
    /// Modern-era challenge key, when present
    pub key: Option<String>,
}

/// Outcome of a successful negotiation.
#[derive(Debug)]
pub struct Negotiated {
    /// The parsed request
    pub header: RequestHeader,
    /// First sub-protocol offered by the client, if any
    pub sub_protocol: Option<String>,
    /// Wire format derived from the sub-protocol
    pub format: String,
    /// Session id from the cookie, or a freshly synthesized one
    pub session_id: String,
    /// Whether the session id was synthesized (a `Set-Cookie` goes out)
    pub session_synthesized: bool,
    /// Response bytes to write back on the socket
    pub response: Vec<u8>,
}

/// Reads the raw request until the header terminator or the deadline.
///
/// Absence of a terminator within the timeout is rejection for absence of
/// handshake, not an I/O error.
pub async fn read_request<S>(stream: &mut S, deadline: Duration) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut request = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];

    let read_all = async {
        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return Err(HandshakeError::NoHandshake),
                Ok(n) => n,
            };
            request.extend_from_slice(&chunk[..n]);
            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                return Ok(());
            }
            if request.len() > MAX_REQUEST_BYTES {
                return Err(HandshakeError::RequestTooLarge);
            }
        }
    };

    let outcome = tokio::time::timeout(deadline, read_all).await;
    match outcome {
        Ok(Ok(())) => Ok(request),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(HandshakeError::NoHandshake),
    }
}

/// Parses the request bytes into a [`RequestHeader`].
pub fn parse_request(raw: &[u8]) -> Result<RequestHeader, HandshakeError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| HandshakeError::Malformed("request is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| HandshakeError::Malformed("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    match parts.next() {
        Some("GET") => {}
        other => {
            return Err(HandshakeError::Malformed(format!(
                "expected GET, got {other:?}"
            )))
        }
    }
    let raw_path = parts
        .next()
        .ok_or_else(|| HandshakeError::Malformed("request line has no path".into()))?;

    // The path may carry an argument section after a reserved `;`:
    // /tokamak;format=json;flag=1
    let mut path_parts = raw_path.split(';');
    let path = path_parts.next().unwrap_or("/").to_string();
    let mut args = HashMap::new();
    for part in path_parts {
        if let Some((key, value)) = part.split_once('=') {
            args.insert(key.to_string(), value.to_string());
        }
    }

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let mut cookies = HashMap::new();
    if let Some(cookie_header) = headers.get("cookie") {
        for pair in cookie_header.split("; ") {
            if let Some((name, value)) = pair.split_once('=') {
                cookies.insert(name.to_string(), value.to_string());
            }
        }
    }

    // Candidates may arrive space-separated in a single header.
    let sub_protocols: Vec<String> = headers
        .get("sec-websocket-protocol")
        .or_else(|| headers.get("websocket-protocol"))
        .map(|value| value.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let key = headers.get("sec-websocket-key").cloned();
    let draft = if key.is_some() {
        Draft::Hybi
    } else {
        Draft::Hixie
    };

    let version = match (draft, headers.get("sec-websocket-version")) {
        (Draft::Hybi, Some(raw)) => {
            let version: u16 = raw
                .parse()
                .map_err(|_| HandshakeError::Malformed(format!("bad version {raw:?}")))?;
            if !SUPPORTED_VERSIONS.contains(&version) {
                return Err(HandshakeError::UnsupportedVersion(version));
            }
            version
        }
        (Draft::Hybi, None) => DEFAULT_HYBI_VERSION,
        (Draft::Hixie, _) => DEFAULT_HIXIE_VERSION,
    };

    Ok(RequestHeader {
        path,
        args,
        host: headers.get("host").cloned(),
        origin: headers
            .get("origin")
            .or_else(|| headers.get("sec-websocket-origin"))
            .cloned(),
        cookies,
        sub_protocols,
        draft,
        version,
        key,
    })
}

/// Checks an origin against the configured allow-list.
///
/// An empty list admits everything. Entries expand `*` to `.*` and must
/// match the origin's host (or the full origin string) end to end, so
/// `*.example.com` admits `a.example.com` but not `example.com`.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(origin) = origin else {
        return false;
    };
    let host = origin
        .split("://")
        .last()
        .and_then(|rest| rest.split('/').next())
        .and_then(|rest| rest.split(':').next())
        .unwrap_or(origin);

    allowed.iter().any(|entry| {
        let pattern = format!("^{}$", regex::escape(entry).replace(r"\*", ".*"));
        match Regex::new(&pattern) {
            Ok(re) => re.is_match(host) || re.is_match(origin),
            Err(_) => false,
        }
    })
}

/// Derives the modern accept key for the response.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Synthesizes a fresh hashed session id.
pub fn synthesize_session_id() -> String {
    let nonce: [u8; 16] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(nonce);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Maps a negotiated sub-protocol to its wire-format string.
pub fn format_from_sub_protocol(sub_protocol: Option<&str>) -> String {
    match sub_protocol {
        Some(proto) => proto
            .strip_prefix(SUB_PROTOCOL_PREFIX)
            .unwrap_or(proto)
            .to_string(),
        None => tokamak_protocol::FORMAT_JSON.to_string(),
    }
}

/// Validates the parsed request and builds the handshake response.
pub fn negotiate(
    header: RequestHeader,
    allowed_origins: &[String],
) -> Result<Negotiated, HandshakeError> {
    if !origin_allowed(header.origin.as_deref(), allowed_origins) {
        return Err(HandshakeError::OriginRejected(
            header.origin.clone().unwrap_or_else(|| "<none>".into()),
        ));
    }

    // First offered candidate wins; there is no content negotiation.
    let sub_protocol = header.sub_protocols.first().cloned();
    let format = format_from_sub_protocol(sub_protocol.as_deref());

    let (session_id, session_synthesized) = match header.cookies.get(SESSION_COOKIE) {
        Some(sid) => (sid.clone(), false),
        None => (synthesize_session_id(), true),
    };

    let mut response = String::new();
    match header.draft {
        Draft::Hybi => {
            let key = header
                .key
                .as_deref()
                .ok_or_else(|| HandshakeError::Malformed("modern draft without key".into()))?;
            response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
            response.push_str("Upgrade: websocket\r\n");
            response.push_str("Connection: Upgrade\r\n");
            response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept_key(key)));
            if let Some(proto) = &sub_protocol {
                response.push_str(&format!("Sec-WebSocket-Protocol: {proto}\r\n"));
            }
        }
        Draft::Hixie => {
            response.push_str("HTTP/1.1 101 WebSocket Protocol Handshake\r\n");
            response.push_str("Upgrade: WebSocket\r\n");
            response.push_str("Connection: Upgrade\r\n");
            if let Some(origin) = &header.origin {
                response.push_str(&format!("WebSocket-Origin: {origin}\r\n"));
            }
            if let Some(host) = &header.host {
                response.push_str(&format!("WebSocket-Location: ws://{host}{}\r\n", header.path));
            }
            if let Some(proto) = &sub_protocol {
                response.push_str(&format!("WebSocket-Protocol: {proto}\r\n"));
            }
        }
    }
    if session_synthesized {
        response.push_str(&format!("Set-Cookie: {SESSION_COOKIE}={session_id}; Path=/\r\n"));
    }
    response.push_str("\r\n");

    Ok(Negotiated {
        header,
        sub_protocol,
        format,
        session_id,
        session_synthesized,
        response: response.into_bytes(),
    })
}
