//! Transport over a UDP datagram flow pinned to one client.
//!
//! The framing layer expects a byte stream while the wire delivers
//! datagrams, so the read half keeps a spill buffer for bytes past what the
//! caller asked for. Writes are chunked to stay under the conservative IPv4
//! MTU payload.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{LinkError, Transport, TransportPair};

/// Largest datagram payload assumed to survive any IPv4 path unfragmented.
pub const MAX_DATAGRAM: usize = 508;
const RECV_CHUNK: usize = 4096;

/// One half of a pinned datagram flow. Both halves share the socket and the
/// pinned peer; only the read half carries a spill buffer.
pub struct UdpLink {
    socket: UdpSocket,
    peer: Arc<Mutex<SocketAddr>>,
    spill: Vec<u8>,
}

/// Pins `peer` as the client of `socket` and splits the flow into halves.
/// `timeout` applies to each receive call.
pub fn pinned(
    socket: UdpSocket,
    peer: SocketAddr,
    timeout: Duration,
) -> Result<TransportPair, LinkError> {
    socket.set_read_timeout(Some(timeout)).map_err(LinkError::from_io)?;
    socket.set_write_timeout(Some(timeout)).map_err(LinkError::from_io)?;
    let writer = socket.try_clone().map_err(LinkError::from_io)?;
    let peer = Arc::new(Mutex::new(peer));
    Ok((
        Box::new(UdpLink { socket, peer: Arc::clone(&peer), spill: Vec::new() }),
        Box::new(UdpLink { socket: writer, peer, spill: Vec::new() }),
    ))
}

impl UdpLink {
    /// Whether a datagram from `addr` belongs to this flow. The same IP on a
    /// new port rebinds the pin (the client rebooted or its NAT mapping
    /// moved); a different IP is discarded.
    fn accept_addr(&self, addr: SocketAddr) -> bool {
        let mut peer = self.peer.lock();
        if addr == *peer {
            true
        } else if addr.ip() == peer.ip() {
            warn!(old = %*peer, new = %addr, "client port changed, rebinding");
            *peer = addr;
            true
        } else {
            info!(%addr, "ignoring datagram from unauthorized address");
            false
        }
    }

    fn take_spill(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.spill.len());
        for (dst, src) in buf.iter_mut().zip(self.spill.drain(..n)) {
            *dst = src;
        }
        n
    }
}

impl Transport for UdpLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if !self.spill.is_empty() {
            return Ok(self.take_spill(buf));
        }

        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            let (n, addr) = self.socket.recv_from(&mut chunk).map_err(LinkError::from_io)?;
            if !self.accept_addr(addr) {
                continue;
            }
            let copied = buf.len().min(n);
            buf[..copied].copy_from_slice(&chunk[..copied]);
            self.spill.extend_from_slice(&chunk[copied..n]);
            return Ok(copied);
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        let peer = *self.peer.lock();
        for chunk in buf.chunks(MAX_DATAGRAM) {
            let sent = self.socket.send_to(chunk, peer).map_err(LinkError::from_io)?;
            if sent != chunk.len() {
                return Err(LinkError::Io(std::io::Error::other("short datagram write")));
            }
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, LinkError> {
        self.socket.set_nonblocking(true).map_err(LinkError::from_io)?;
        let mut chunk = [0u8; RECV_CHUNK];
        let received = self.socket.recv_from(&mut chunk);
        self.socket.set_nonblocking(false).map_err(LinkError::from_io)?;
        match received {
            Ok((n, addr)) => {
                if self.accept_addr(addr) {
                    self.spill.extend_from_slice(&chunk[..n]);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(LinkError::from_io(err)),
        }
        Ok(self.spill.len())
    }

    fn flush_input(&mut self) -> Result<(), LinkError> {
        self.spill.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> (TransportPair, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let peer = client.local_addr().unwrap();
        (pinned(server, peer, Duration::from_millis(200)).unwrap(), client)
    }

    #[test]
    fn writes_are_chunked_at_mtu() {
        let ((_rx, mut tx), client) = flow();
        tx.write_all(&[0x5A; 1200]).unwrap();

        let mut sizes = Vec::new();
        let mut buf = [0u8; 2048];
        for _ in 0..3 {
            let (n, _) = client.recv_from(&mut buf).unwrap();
            sizes.push(n);
        }
        assert_eq!(sizes, [508, 508, 184]);
    }

    #[test]
    fn spill_buffer_bridges_datagrams_to_stream() {
        let ((mut rx, mut tx), client) = flow();

        // Learn the server address from an outbound write, then deliver one
        // datagram larger than the read buffer.
        tx.write_all(b"?").unwrap();
        let mut one = [0u8; 1];
        let (_, srv) = client.recv_from(&mut one).unwrap();
        client.send_to(&[1, 2, 3, 4, 5, 6], srv).unwrap();

        let mut buf = [0u8; 2];
        let mut got = Vec::new();
        for _ in 0..3 {
            let n = rx.read(&mut buf).unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, [1, 2, 3, 4, 5, 6]);

        // Nothing left once the spill is drained.
        assert!(matches!(rx.read(&mut buf), Err(LinkError::Timeout)));
    }

    #[test]
    fn same_ip_port_change_rebinds_pin() {
        let ((mut rx, mut tx), original) = flow();

        let moved = UdpSocket::bind("127.0.0.1:0").unwrap();
        moved.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

        // Learn the server address, then send from the new port.
        tx.write_all(b"?").unwrap();
        let mut one = [0u8; 1];
        let (_, srv) = original.recv_from(&mut one).unwrap();
        moved.send_to(b"hi", srv).unwrap();

        let mut buf = [0u8; 2];
        let n = rx.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");

        // Writes now land on the rebound port.
        tx.write_all(b"ack").unwrap();
        let mut buf = [0u8; 8];
        let (n, _) = moved.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ack");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn foreign_ip_is_discarded() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let srv = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let (mut rx, _tx) =
            pinned(server, client.local_addr().unwrap(), Duration::from_millis(200)).unwrap();

        // Loopback is a /8, so a second loopback address acts as a foreign host.
        let intruder = UdpSocket::bind("127.0.0.2:0").unwrap();
        intruder.send_to(b"evil", srv).unwrap();
        client.send_to(b"good", srv).unwrap();

        let mut buf = [0u8; 8];
        let n = rx.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"good");
    }
}
