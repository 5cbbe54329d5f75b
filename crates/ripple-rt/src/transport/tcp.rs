//! Plain TCP transport.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use super::{TransportControl, TransportParts};

struct TcpControl(TcpStream);

impl TransportControl for TcpControl {
    fn close(&self) {
        // NotConnected after the peer already hung up is expected.
        let _ = self.0.shutdown(Shutdown::Both);
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.0.set_read_timeout(timeout)
    }
}

/// Split a connected socket into reader, writer, and control handles that
/// all refer to the same kernel socket.
pub fn split(stream: TcpStream) -> io::Result<TransportParts> {
    stream.set_nodelay(true)?;
    let peer_addr = stream.peer_addr().ok();
    let writer = stream.try_clone()?;
    let control = stream.try_clone()?;
    Ok(TransportParts {
        reader: Box::new(stream),
        writer: Box::new(writer),
        control: Box::new(TcpControl(control)),
        peer_addr,
    })
}
