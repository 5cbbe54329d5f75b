//! WebSocket opening handshake (RFC 6455 Section 4), both roles.
//!
//! - [`compute_accept_key`]: SHA-1 + Base64 computation per RFC 6455 Section 4.2.2
//! - [`generate_key`]: Fresh random `Sec-WebSocket-Key` for the initiator
//! - [`write_upgrade_request`]: Initiator's `GET` upgrade request
//! - [`validate_upgrade_response`]: Initiator's check of the server's reply
//! - [`upgrade_key`]: Acceptor's recognition of an upgrade request
//! - [`write_upgrade_response`]: Acceptor's `101 Switching Protocols`
//! - [`write_bad_request`]: Acceptor's `400 Bad Request`

use std::io::Write;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;
use crate::http::{HttpRequest, HttpResponse};

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` value per RFC 6455 Section 4.2.2.
///
/// Concatenates `client_key` + [`WS_GUID`], SHA-1 hashes, then Base64 encodes.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// 16 random bytes, Base64 encoded.
pub fn generate_key() -> String {
    BASE64.encode(rand::random::<[u8; 16]>())
}

/// Write the initiator's upgrade request.
///
/// `host` is sent verbatim as the `Host` header, so callers include the port
/// when it is not the scheme default.
pub fn write_upgrade_request<W: Write + ?Sized>(
    stream: &mut W,
    host: &str,
    path: &str,
    key: &str,
) -> std::io::Result<()> {
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        path, host, key
    );
    stream.write_all(request.as_bytes())?;
    stream.flush()
}

/// Check the acceptor's reply against the key we sent.
///
/// Requires status 101, `Upgrade: websocket` (value compared
/// case-insensitively), and a `Sec-WebSocket-Accept` equal to
/// [`compute_accept_key`] of `key`. The first failing check is reported.
pub fn validate_upgrade_response(response: &HttpResponse, key: &str) -> Result<(), HandshakeError> {
    if response.status != 101 {
        return Err(HandshakeError::UnexpectedStatus(response.status));
    }

    match response.headers.get("Upgrade") {
        Some(v) if v.trim().eq_ignore_ascii_case("websocket") => {}
        Some(v) => return Err(HandshakeError::InvalidUpgrade(v.to_string())),
        None => return Err(HandshakeError::MissingHeader("Upgrade")),
    }

    let actual = response
        .headers
        .get("Sec-WebSocket-Accept")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
    let expected = compute_accept_key(key);
    if actual.trim() != expected {
        return Err(HandshakeError::AcceptMismatch {
            expected,
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// The client key of a WebSocket upgrade request, or `None` when the request
/// should be treated as plain HTTP.
///
/// A request is an upgrade when its method is `GET`, its `Upgrade` header is
/// `websocket` (case-insensitive) and it carries a `Sec-WebSocket-Key`. The
/// key's format is not checked.
pub fn upgrade_key(request: &HttpRequest) -> Option<&str> {
    if request.method != "GET" {
        return None;
    }
    match request.headers.get("Upgrade") {
        Some(v) if v.trim().eq_ignore_ascii_case("websocket") => {}
        _ => return None,
    }
    request
        .headers
        .get("Sec-WebSocket-Key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

/// Write the `101 Switching Protocols` response to the stream.
pub fn write_upgrade_response<W: Write + ?Sized>(
    stream: &mut W,
    accept_key: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

/// Write a `400 Bad Request` response with the given reason.
pub fn write_bad_request<W: Write + ?Sized>(stream: &mut W, reason: &str) -> std::io::Result<()> {
    let body = format!("Bad Request: {}", reason);
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{read_request, read_response, Headers};
    use std::io::Cursor;

    fn response_101(accept: &str) -> HttpResponse {
        HttpResponse::new(101)
            .with_header("Upgrade", "websocket")
            .with_header("Connection", "Upgrade")
            .with_header("Sec-WebSocket-Accept", accept)
    }

    #[test]
    fn test_compute_accept_key_rfc_example() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key_is_16_random_bytes() {
        let a = generate_key();
        let b = generate_key();
        assert_eq!(BASE64.decode(&a).unwrap().len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_upgrade_request_format() {
        let mut out = Vec::new();
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        write_upgrade_request(&mut out, "example.com:9000", "/chat", key).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let req = read_request(&mut Cursor::new(out)).unwrap();
        assert_eq!(req.headers.get("Host"), Some("example.com:9000"));
        assert_eq!(req.headers.get("Connection"), Some("Upgrade"));
        assert_eq!(req.headers.get("Sec-WebSocket-Version"), Some("13"));
        assert_eq!(upgrade_key(&req), Some("dGhlIHNhbXBsZSBub25jZQ=="));
    }

    #[test]
    fn test_upgrade_response_exact_bytes() {
        let mut out = Vec::new();
        write_upgrade_response(&mut out, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=").unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_acceptor_output_satisfies_initiator() {
        let key = generate_key();
        let mut out = Vec::new();
        write_upgrade_response(&mut out, &compute_accept_key(&key)).unwrap();
        let resp = read_response(&mut Cursor::new(out)).unwrap();
        assert_eq!(validate_upgrade_response(&resp, &key), Ok(()));
    }

    #[test]
    fn test_validate_rejects_wrong_status() {
        let resp = HttpResponse::new(200);
        assert_eq!(
            validate_upgrade_response(&resp, "x"),
            Err(HandshakeError::UnexpectedStatus(200))
        );
    }

    #[test]
    fn test_validate_upgrade_header() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let mut resp = HttpResponse::new(101);
        assert_eq!(
            validate_upgrade_response(&resp, key),
            Err(HandshakeError::MissingHeader("Upgrade"))
        );

        resp.headers.append("Upgrade", "h2c");
        assert_eq!(
            validate_upgrade_response(&resp, key),
            Err(HandshakeError::InvalidUpgrade("h2c".to_string()))
        );

        let mut headers = Headers::new();
        headers.append("upgrade", "WebSocket");
        headers.append("sec-websocket-accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        resp.headers = headers;
        assert_eq!(validate_upgrade_response(&resp, key), Ok(()));
    }

    #[test]
    fn test_validate_accept_missing_and_mismatch() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let resp = HttpResponse::new(101).with_header("Upgrade", "websocket");
        assert_eq!(
            validate_upgrade_response(&resp, key),
            Err(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))
        );

        let resp = response_101("bogus=");
        match validate_upgrade_response(&resp, key) {
            Err(HandshakeError::AcceptMismatch { expected, actual }) => {
                assert_eq!(expected, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
                assert_eq!(actual, "bogus=");
            }
            other => panic!("expected AcceptMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_upgrade_key_recognition() {
        let parse = |raw: &str| read_request(&mut Cursor::new(raw.as_bytes().to_vec())).unwrap();

        let req = parse("GET / HTTP/1.1\r\nUpgrade: WebSocket\r\nSec-WebSocket-Key: abc\r\n\r\n");
        assert_eq!(upgrade_key(&req), Some("abc"));

        let req = parse("POST / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: abc\r\n\r\n");
        assert_eq!(upgrade_key(&req), None);

        let req = parse("GET / HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\r\n");
        assert_eq!(upgrade_key(&req), None);

        let req = parse("GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        assert_eq!(upgrade_key(&req), None);
    }

    #[test]
    fn test_bad_request_format() {
        let mut out = Vec::new();
        write_bad_request(&mut out, "handshake failed").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.ends_with("Bad Request: handshake failed"));
    }
}
