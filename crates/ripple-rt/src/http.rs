//! Minimal HTTP/1.1 message handling for the opening handshake.
//!
//! Only what the upgrade exchange needs: parse a request or response head
//! from a buffered stream, write a response, and hand non-upgrade requests
//! to an application [`HttpHandler`]. Parsing reads through the same
//! `BufRead` the WebSocket connection later uses, so bytes that arrive right
//! after the header block are not lost.

use std::io::{BufRead, Read, Write};

use crate::error::{HandshakeError, WsError, WsResult};

/// Longest accepted request/status/header line, in bytes.
const MAX_LINE_LEN: u64 = 8 * 1024;

/// Most header lines accepted in one message.
const MAX_HEADERS: usize = 100;

/// Largest request body read for plain HTTP requests.
const MAX_BODY_LEN: usize = 1024 * 1024;

/// Case-insensitive header multi-map preserving insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A parsed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

/// An HTTP response, either parsed (client handshake) or built for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        HttpResponse {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Plain-text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        HttpResponse::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into().into_bytes())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

/// Handles requests that are not WebSocket upgrades.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

/// Answers every plain HTTP request with `404 Not Found`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFound;

impl HttpHandler for NotFound {
    fn handle(&self, _request: &HttpRequest) -> HttpResponse {
        HttpResponse::text(404, "Not Found")
    }
}

impl<F> HttpHandler for F
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
{
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        self(request)
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        _ => "",
    }
}

/// Read one CRLF (or bare LF) terminated line, without the terminator.
///
/// End of stream before any byte is a transport error.
fn read_line<R: BufRead + ?Sized>(reader: &mut R) -> WsResult<String> {
    let mut raw = Vec::new();
    let n = reader.take(MAX_LINE_LEN).read_until(b'\n', &mut raw)?;
    if n == 0 {
        return Err(WsError::Transport(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream closed before HTTP line",
        )));
    }
    if raw.last() != Some(&b'\n') {
        return Err(WsError::Handshake(HandshakeError::MalformedRequest(
            "header line too long or unterminated".to_string(),
        )));
    }
    raw.pop();
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Read header lines up to and including the blank line.
fn read_headers<R: BufRead + ?Sized>(reader: &mut R) -> WsResult<Headers> {
    let mut headers = Headers::new();
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(WsError::Handshake(HandshakeError::MalformedRequest(
                "too many headers".to_string(),
            )));
        }
        // Split on the first ':' only; values may contain colons.
        if let Some((name, value)) = line.split_once(':') {
            headers.append(name.trim(), value.trim());
        }
    }
}

/// Parse a request line, headers, and (when `Content-Length` is given) body.
pub fn read_request<R: BufRead + ?Sized>(reader: &mut R) -> WsResult<HttpRequest> {
    let request_line = read_line(reader)?;
    let mut parts = request_line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v)) => (m.to_string(), p.to_string(), v.to_string()),
        _ => {
            return Err(WsError::Handshake(HandshakeError::MalformedRequest(format!(
                "malformed request line: {:?}",
                request_line
            ))))
        }
    };

    let headers = read_headers(reader)?;

    let body = match headers.get("Content-Length") {
        Some(raw_len) => {
            let len: usize = raw_len.parse().map_err(|_| {
                WsError::Handshake(HandshakeError::MalformedRequest(format!(
                    "invalid Content-Length: {:?}",
                    raw_len
                )))
            })?;
            if len > MAX_BODY_LEN {
                return Err(WsError::Handshake(HandshakeError::MalformedRequest(format!(
                    "body of {} bytes exceeds limit",
                    len
                ))));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body)?;
            Some(body)
        }
        None => None,
    };

    Ok(HttpRequest {
        method,
        path,
        version,
        headers,
        body,
    })
}

/// Parse a status line and headers. The body is left unread: after a
/// `101 Switching Protocols` the stream carries WebSocket frames.
pub fn read_response<R: BufRead + ?Sized>(reader: &mut R) -> WsResult<HttpResponse> {
    let status_line = read_line(reader)?;
    if !status_line.starts_with("HTTP/1.") {
        return Err(WsError::Handshake(HandshakeError::MalformedResponse(format!(
            "bad status line: {:?}",
            status_line
        ))));
    }
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            WsError::Handshake(HandshakeError::MalformedResponse(format!(
                "bad status code in {:?}",
                status_line
            )))
        })?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = read_headers(reader)?;
    Ok(HttpResponse {
        status,
        reason,
        headers,
        body: Vec::new(),
    })
}

/// Serialize a response. `Content-Length` is added when the response has a
/// body and the header was not set explicitly.
pub fn write_response<W: Write + ?Sized>(
    writer: &mut W,
    response: &HttpResponse,
) -> std::io::Result<()> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason);
    for (name, value) in response.headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    if !response.body.is_empty() && !response.headers.contains("Content-Length") {
        out.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    out.push_str("\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&response.body);
    writer.write_all(&bytes)?;
    writer.flush()
}
