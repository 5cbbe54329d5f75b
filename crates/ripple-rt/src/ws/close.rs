//! Close frame payloads and status codes (RFC 6455 Section 5.5.1, 7.4).
//!
//! - [`parse_close_code`]: Extract the status code, if any, from a close payload
//! - [`parse_close_payload`]: Extract status code + reason
//! - [`build_close_payload`]: Build a close payload from code + reason

use super::frame::MAX_CONTROL_PAYLOAD;

/// Well-known WebSocket close status codes per RFC 6455 Section 7.4.1.
pub struct CloseCode;

impl CloseCode {
    /// Normal closure (1000).
    pub const NORMAL: u16 = 1000;
    /// Going away (1001) -- also used when a heartbeat pong is overdue.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error (1002).
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No status code was present (1005). Never sent on the wire.
    pub const NO_STATUS: u16 = 1005;
    /// Invalid frame payload data (1007) -- invalid UTF-8 in strict mode.
    pub const INVALID_DATA: u16 = 1007;
    /// Message too big (1009).
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Internal error (1011) -- an application callback panicked.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Status code from the first two payload bytes (big-endian), or `None`
/// when the payload is too short to carry one.
pub fn parse_close_code(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Parse a close payload into (status_code, reason).
///
/// Payloads shorter than two bytes yield `(1005, "")`. The reason is decoded
/// lossily.
pub fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    match parse_close_code(payload) {
        Some(code) => (code, String::from_utf8_lossy(&payload[2..]).into_owned()),
        None => (CloseCode::NO_STATUS, String::new()),
    }
}

/// Build a close payload: 2 bytes of code followed by the reason.
///
/// The reason is truncated (on a character boundary) so the payload fits
/// the 125-byte control frame limit.
pub fn build_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let max_reason_len = MAX_CONTROL_PAYLOAD - 2;
    let mut end = reason.len().min(max_reason_len);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_close_normal() {
        let payload = vec![0x03, 0xE8, b'o', b'k'];
        assert_eq!(parse_close_payload(&payload), (1000, "ok".to_string()));
        assert_eq!(parse_close_code(&payload), Some(1000));
    }

    #[test]
    fn test_parse_close_empty() {
        assert_eq!(parse_close_payload(&[]), (1005, String::new()));
        assert_eq!(parse_close_code(&[]), None);
        assert_eq!(parse_close_code(&[0x03]), None);
    }

    #[test]
    fn test_build_close_payload() {
        assert_eq!(build_close_payload(1000, "bye"), vec![0x03, 0xE8, b'b', b'y', b'e']);
        assert_eq!(build_close_payload(1001, ""), vec![0x03, 0xE9]);
    }

    #[test]
    fn test_build_close_truncates_reason() {
        let payload = build_close_payload(1000, &"x".repeat(200));
        assert_eq!(payload.len(), 125, "payload should be capped at 125 bytes (2 + 123)");
        assert_eq!(&payload[..2], &[0x03, 0xE8]);
    }

    #[test]
    fn test_build_close_truncates_on_char_boundary() {
        // 62 two-byte characters = 124 bytes; 123 would split the last one
        let reason = "é".repeat(62);
        let payload = build_close_payload(1000, &reason);
        assert_eq!(payload.len(), 2 + 122);
        assert!(std::str::from_utf8(&payload[2..]).is_ok());
    }
}
