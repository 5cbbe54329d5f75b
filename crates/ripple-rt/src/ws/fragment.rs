//! Reassembly of fragmented inbound messages (RFC 6455 Section 5.4).
//!
//! Control frames are answered by the receive loop before they reach the
//! [`Reassembler`]; only data and continuation frames are fed here.

use super::frame::{Frame, Opcode};

/// Outcome of feeding one data frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly {
    /// A whole message: the opcode of its first frame and its payload.
    Message(Opcode, Vec<u8>),
    /// More continuation frames are expected.
    Pending,
    /// The message grew past the configured limit.
    TooLarge,
    /// Frame order violated the fragmentation rules.
    Violation(&'static str),
}

/// Per-connection fragment buffer.
#[derive(Debug)]
pub struct Reassembler {
    opcode: Option<Opcode>,
    buffer: Vec<u8>,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Reassembler {
            opcode: None,
            buffer: Vec::new(),
            max_message_size,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    fn reset(&mut self) {
        self.opcode = None;
        self.buffer = Vec::new();
    }

    pub fn push(&mut self, frame: Frame) -> Reassembly {
        match (frame.opcode, self.opcode) {
            (Opcode::Text | Opcode::Binary, Some(_)) => {
                self.reset();
                Reassembly::Violation("new data frame while a fragmented message is in progress")
            }
            (Opcode::Text | Opcode::Binary, None) => {
                if frame.payload.len() > self.max_message_size {
                    return Reassembly::TooLarge;
                }
                if frame.fin {
                    Reassembly::Message(frame.opcode, frame.payload)
                } else {
                    self.opcode = Some(frame.opcode);
                    self.buffer = frame.payload;
                    Reassembly::Pending
                }
            }
            (Opcode::Continuation, None) => {
                Reassembly::Violation("continuation frame with no message in progress")
            }
            (Opcode::Continuation, Some(opcode)) => {
                if self.buffer.len() + frame.payload.len() > self.max_message_size {
                    self.reset();
                    return Reassembly::TooLarge;
                }
                self.buffer.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Reassembly::Pending;
                }
                let payload = std::mem::take(&mut self.buffer);
                self.opcode = None;
                Reassembly::Message(opcode, payload)
            }
            (Opcode::Close | Opcode::Ping | Opcode::Pong, _) => {
                Reassembly::Violation("control frame passed to reassembly")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Frame {
        Frame {
            fin,
            opcode,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_unfragmented_passes_through() {
        let mut r = Reassembler::new(1024);
        assert_eq!(
            r.push(frame(true, Opcode::Text, b"hi")),
            Reassembly::Message(Opcode::Text, b"hi".to_vec())
        );
        assert!(!r.in_progress());
    }

    #[test]
    fn test_three_part_message() {
        let mut r = Reassembler::new(1024);
        assert_eq!(r.push(frame(false, Opcode::Binary, b"ab")), Reassembly::Pending);
        assert!(r.in_progress());
        assert_eq!(r.push(frame(false, Opcode::Continuation, b"cd")), Reassembly::Pending);
        assert_eq!(
            r.push(frame(true, Opcode::Continuation, b"ef")),
            Reassembly::Message(Opcode::Binary, b"abcdef".to_vec())
        );
        assert!(!r.in_progress());
    }

    #[test]
    fn test_orphan_continuation() {
        let mut r = Reassembler::new(1024);
        assert!(matches!(
            r.push(frame(true, Opcode::Continuation, b"x")),
            Reassembly::Violation(_)
        ));
    }

    #[test]
    fn test_new_message_mid_sequence() {
        let mut r = Reassembler::new(1024);
        r.push(frame(false, Opcode::Text, b"a"));
        assert!(matches!(r.push(frame(true, Opcode::Text, b"b")), Reassembly::Violation(_)));
        assert!(!r.in_progress());
    }

    #[test]
    fn test_size_limit() {
        let mut r = Reassembler::new(4);
        assert_eq!(r.push(frame(true, Opcode::Text, b"12345")), Reassembly::TooLarge);

        assert_eq!(r.push(frame(false, Opcode::Text, b"123")), Reassembly::Pending);
        assert_eq!(r.push(frame(true, Opcode::Continuation, b"45")), Reassembly::TooLarge);
        assert!(!r.in_progress());
    }
}
