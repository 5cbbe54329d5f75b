//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! Frames are the smallest unit of WebSocket communication. The codec is
//! stateless: it only knows the bytes it reads or writes.
//!
//! - [`read_frame`]: Parse a single frame from a byte stream (handles masking)
//! - [`encode_frame`]: Serialize a final frame, masked or unmasked
//! - [`write_frame`]: Encode and write a frame in a single `write_all`
//! - [`apply_mask`]: Symmetric XOR masking per RFC 6455 Section 5.3

use std::io::{Read, Write};

use crate::error::{WsError, WsResult};

/// Default cap on a single frame's payload (64 MiB), guarding against OOM
/// from hostile 64-bit lengths.
pub const MAX_PAYLOAD_SIZE: u64 = 64 * 1024 * 1024;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcodes per RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse a 4-bit opcode value.
    ///
    /// Values 3-7 and 11-15 are reserved and fail with a protocol error.
    pub fn from_u8(byte: u8) -> WsResult<Opcode> {
        match byte {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(WsError::protocol(format!("unknown opcode: 0x{:X}", byte))),
        }
    }

    /// Close, Ping and Pong are control opcodes.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// A decoded WebSocket frame. The payload is always unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// FIN bit -- `true` unless this is a non-terminal fragment.
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a final frame.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: &str) -> Self {
        Frame::new(Opcode::Text, text.as_bytes())
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Apply or remove the 4-byte XOR mask on a payload.
///
/// The operation is symmetric: applying the mask twice returns the original.
pub fn apply_mask(payload: &mut [u8], mask_key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Parse one frame from the stream with the default payload cap.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> WsResult<Frame> {
    read_frame_limited(reader, MAX_PAYLOAD_SIZE)
}

/// Parse one frame from the stream, rejecting payloads over `max_payload`.
///
/// Handles all three payload length encodings (7-bit, 16-bit, 64-bit) and
/// XOR unmasking. Every read goes through `read_exact`, so a payload that
/// arrives in several chunks is accumulated until the declared length is
/// satisfied; a stream that ends first surfaces as a transport error.
pub fn read_frame_limited<R: Read + ?Sized>(reader: &mut R, max_payload: u64) -> WsResult<Frame> {
    // Byte 0: FIN(1) RSV(3) Opcode(4)
    // Byte 1: MASK(1) Payload-Length(7)
    let mut header = [0u8; 2];
    reader.read_exact(&mut header)?;

    let fin = (header[0] & 0x80) != 0;
    if header[0] & 0x70 != 0 {
        return Err(WsError::protocol("reserved bits set"));
    }
    let opcode = Opcode::from_u8(header[0] & 0x0F)?;

    let masked = (header[1] & 0x80) != 0;
    let length_code = header[1] & 0x7F;

    let payload_len: u64 = match length_code {
        126 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            u64::from(u16::from_be_bytes(buf))
        }
        127 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            let len = u64::from_be_bytes(buf);
            if len >> 63 != 0 {
                return Err(WsError::protocol("MSB of 64-bit length must be 0"));
            }
            len
        }
        len => u64::from(len),
    };

    if opcode.is_control() {
        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(WsError::protocol(format!(
                "control frame payload of {} bytes exceeds 125",
                payload_len
            )));
        }
        if !fin {
            return Err(WsError::protocol("fragmented control frame"));
        }
    }

    if payload_len > max_payload {
        return Err(WsError::protocol(format!(
            "payload length {} exceeds maximum {}",
            payload_len, max_payload
        )));
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key)?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload)?;
    }

    if let Some(key) = mask_key {
        apply_mask(&mut payload, &key);
    }

    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

/// Serialize a final frame.
///
/// With `mask = Some(key)` the MASK bit is set, the key follows the length
/// field, and the payload is XOR-masked. Outgoing frames are never
/// fragmented.
pub fn encode_frame(payload: &[u8], opcode: Opcode, mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    let mut out = Vec::with_capacity(len + 14);
    out.push(0x80 | opcode as u8);

    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 65535 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], &key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Encode one final frame and write it with a single `write_all`, then flush.
///
/// The caller is responsible for holding the connection's write lock so the
/// frame's bytes are not interleaved with another writer's.
pub fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    opcode: Opcode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> WsResult<()> {
    let bytes = encode_frame(payload, opcode, mask);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// Reader that hands out at most `chunk` bytes per call.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.data.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_mask_roundtrip() {
        let original = b"Hello".to_vec();
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut masked = original.clone();
        apply_mask(&mut masked, &key);
        assert_ne!(masked, original, "masked should differ from original");
        apply_mask(&mut masked, &key);
        assert_eq!(masked, original, "unmasked should equal original");
    }

    #[test]
    fn test_read_7bit_text_frame() {
        let frame_bytes: Vec<u8> = vec![
            0x81,       // FIN=1, opcode=0x1
            0x82,       // MASK=1, len=2
            0, 0, 0, 0, // mask key (all zeros = payload unchanged)
            b'H', b'i',
        ];
        let frame = read_frame(&mut Cursor::new(frame_bytes)).unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"Hi");
    }

    #[test]
    fn test_read_rfc_masked_hello() {
        // RFC 6455 Section 5.7: single-frame masked text message "Hello"
        let bytes = vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let frame = read_frame(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_read_16bit_length() {
        let payload = vec![0xABu8; 200];
        let mut frame_bytes: Vec<u8> = vec![0x82, 0xFE];
        frame_bytes.extend_from_slice(&200u16.to_be_bytes());
        frame_bytes.extend_from_slice(&[0u8; 4]);
        frame_bytes.extend_from_slice(&payload);

        let frame = read_frame(&mut Cursor::new(frame_bytes)).unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_read_64bit_length() {
        let payload = vec![0xCDu8; 300];
        let mut frame_bytes: Vec<u8> = vec![0x82, 0xFF];
        frame_bytes.extend_from_slice(&300u64.to_be_bytes());
        frame_bytes.extend_from_slice(&[0u8; 4]);
        frame_bytes.extend_from_slice(&payload);

        let frame = read_frame(&mut Cursor::new(frame_bytes)).unwrap();
        assert_eq!(frame.payload.len(), 300);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_encode_small_frame() {
        let buf = encode_frame(b"Hello", Opcode::Text, None);
        assert_eq!(buf, vec![0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encode_masked_matches_rfc_example() {
        let buf = encode_frame(b"Hello", Opcode::Text, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(
            buf,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn test_length_code_boundaries() {
        // 125 -> 1-byte length field
        let buf = encode_frame(&vec![0u8; 125], Opcode::Binary, None);
        assert_eq!(buf[1], 125);
        assert_eq!(buf.len(), 2 + 125);

        // 126 and 65535 -> 2-byte extended field
        let buf = encode_frame(&vec![0u8; 126], Opcode::Binary, None);
        assert_eq!(buf[1], 126);
        assert_eq!(&buf[2..4], &126u16.to_be_bytes());
        assert_eq!(buf.len(), 4 + 126);

        let buf = encode_frame(&vec![0u8; 65535], Opcode::Binary, None);
        assert_eq!(buf[1], 126);
        assert_eq!(&buf[2..4], &[0xFF, 0xFF]);

        // 65536 -> 8-byte extended field
        let buf = encode_frame(&vec![0u8; 65536], Opcode::Binary, None);
        assert_eq!(buf[1], 127);
        assert_eq!(&buf[2..10], &65536u64.to_be_bytes());
        assert_eq!(buf.len(), 10 + 65536);

        // masked variants set the high bit on the length byte
        let buf = encode_frame(&vec![0u8; 126], Opcode::Binary, Some([1, 2, 3, 4]));
        assert_eq!(buf[1], 0x80 | 126);
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_masked_roundtrip_across_length_encodings() {
        for len in [0usize, 1, 125, 126, 65535, 65536, 70000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let key: [u8; 4] = rand::random();
            let bytes = encode_frame(&payload, Opcode::Text, Some(key));
            let frame = read_frame(&mut Cursor::new(bytes)).unwrap();
            assert!(frame.fin);
            assert_eq!(frame.opcode, Opcode::Text);
            assert_eq!(frame.payload, payload, "length {} should survive", len);
        }
    }

    #[test]
    fn test_read_accumulates_partial_reads() {
        let payload = vec![0x5Au8; 5000];
        let bytes = encode_frame(&payload, Opcode::Binary, Some([9, 8, 7, 6]));
        let mut reader = Trickle {
            data: Cursor::new(bytes),
            chunk: 7,
        };
        let frame = read_frame(&mut reader).unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_truncated_payload_is_transport_error() {
        let mut bytes = encode_frame(b"truncated payload", Opcode::Text, None);
        bytes.truncate(6);
        let err = read_frame(&mut Cursor::new(bytes)).unwrap_err();
        assert!(err.is_transport(), "premature end should be transport, got {:?}", err);
    }

    #[test]
    fn test_unknown_opcode() {
        for opcode in [0x3u8, 0x7, 0xB, 0xF] {
            let bytes = vec![0x80 | opcode, 0x00];
            let err = read_frame(&mut Cursor::new(bytes)).unwrap_err();
            match err {
                WsError::Protocol(msg) => assert!(msg.contains("unknown opcode"), "got: {}", msg),
                other => panic!("expected protocol error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_nonzero_rsv_rejected() {
        for byte0 in [0xC1u8, 0xA1, 0x91] {
            let err = read_frame(&mut Cursor::new(vec![byte0, 0x00])).unwrap_err();
            match err {
                WsError::Protocol(msg) => assert_eq!(msg, "reserved bits set"),
                other => panic!("expected protocol error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&(1u64 << 40).to_be_bytes());
        let err = read_frame_limited(&mut Cursor::new(bytes), 1024).unwrap_err();
        assert!(matches!(err, WsError::Protocol(_)));
    }

    #[test]
    fn test_oversize_control_frame_rejected() {
        let mut bytes = vec![0x89, 126];
        bytes.extend_from_slice(&200u16.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 200]);
        let err = read_frame(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, WsError::Protocol(_)));
    }

    #[test]
    fn test_write_frame_single_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, Opcode::Pong, b"abc", None).unwrap();
        assert_eq!(buf, vec![0x8A, 0x03, b'a', b'b', b'c']);
    }
}
