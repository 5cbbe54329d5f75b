//! In-process duplex pipe.
//!
//! [`pipe`] returns two connected [`TransportParts`]; bytes written on one
//! side are read on the other. Closing either side's control handle ends
//! the pipe for both, the way `shutdown(Both)` does for a socket. Dropping
//! a writer signals end of stream to the opposite reader.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{TransportControl, TransportParts};

/// An empty chunk marks end of stream.
type Chunk = Vec<u8>;

struct Shared {
    closed: AtomicBool,
}

struct PipeReader {
    rx: Receiver<Chunk>,
    pending: Chunk,
    pos: usize,
    eof: bool,
    timeout: Arc<Mutex<Option<Duration>>>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.pending.len() {
            if self.eof {
                return Ok(0);
            }
            let timeout = *self.timeout.lock();
            let chunk = match timeout {
                Some(t) => match self.rx.recv_timeout(t) {
                    Ok(chunk) => chunk,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                    }
                    Err(RecvTimeoutError::Disconnected) => Vec::new(),
                },
                None => self.rx.recv().unwrap_or_default(),
            };
            if chunk.is_empty() {
                self.eof = true;
            }
            self.pending = chunk;
            self.pos = 0;
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct PipeWriter {
    tx: Sender<Chunk>,
    shared: Arc<Shared>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(Vec::new());
    }
}

struct PipeControl {
    shared: Arc<Shared>,
    wake: [Sender<Chunk>; 2],
    timeout: Arc<Mutex<Option<Duration>>>,
}

impl TransportControl for PipeControl {
    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            for tx in &self.wake {
                let _ = tx.send(Vec::new());
            }
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        if timeout == Some(Duration::ZERO) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero read timeout"));
        }
        *self.timeout.lock() = timeout;
        Ok(())
    }
}

/// A connected pair of in-memory transports.
pub fn pipe() -> (TransportParts, TransportParts) {
    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
    });
    let (a_to_b_tx, a_to_b_rx) = unbounded();
    let (b_to_a_tx, b_to_a_rx) = unbounded();

    let side = |rx: Receiver<Chunk>, tx: Sender<Chunk>| {
        let timeout = Arc::new(Mutex::new(None));
        TransportParts {
            reader: Box::new(PipeReader {
                rx,
                pending: Vec::new(),
                pos: 0,
                eof: false,
                timeout: Arc::clone(&timeout),
            }),
            writer: Box::new(PipeWriter {
                tx,
                shared: Arc::clone(&shared),
            }),
            control: Box::new(PipeControl {
                shared: Arc::clone(&shared),
                wake: [a_to_b_tx.clone(), b_to_a_tx.clone()],
                timeout,
            }),
            peer_addr: None,
        }
    };

    let a = side(b_to_a_rx, a_to_b_tx.clone());
    let b = side(a_to_b_rx, b_to_a_tx.clone());
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_bytes_cross_the_pipe() {
        let (mut a, mut b) = pipe();
        a.writer.write_all(b"hello ").unwrap();
        a.writer.write_all(b"world").unwrap();
        let mut buf = [0u8; 11];
        b.reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");

        b.writer.write_all(b"back").unwrap();
        let mut buf = [0u8; 4];
        a.reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"back");
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let (a, mut b) = pipe();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            b.reader.read(&mut buf).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        a.control.close();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_write_after_close_is_broken_pipe() {
        let (mut a, b) = pipe();
        b.control.close();
        let err = a.writer.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_read_timeout() {
        let (_a, mut b) = pipe();
        b.control.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        let mut buf = [0u8; 1];
        let err = b.reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_dropped_writer_is_eof() {
        let (a, mut b) = pipe();
        drop(a);
        let mut buf = [0u8; 1];
        assert_eq!(b.reader.read(&mut buf).unwrap(), 0);
    }
}
