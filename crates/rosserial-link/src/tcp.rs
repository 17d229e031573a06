//! Transport over an accepted TCP stream.

use std::{
    io::{Read, Write},
    net::TcpStream,
    time::Duration,
};

use crate::{LinkError, RECV_BUFFER_SIZE, Transport, TransportPair, set_recv_buffer};

/// One half of an accepted connection. Both halves share the socket.
pub struct TcpLink {
    stream: TcpStream,
}

/// Tunes an accepted stream (read/write timeouts, receive buffer) and splits
/// it into read and write halves.
pub fn from_stream(stream: TcpStream, timeout: Duration) -> Result<TransportPair, LinkError> {
    stream.set_read_timeout(Some(timeout)).map_err(LinkError::from_io)?;
    stream.set_write_timeout(Some(timeout)).map_err(LinkError::from_io)?;
    set_recv_buffer(&stream, RECV_BUFFER_SIZE);
    let writer = stream.try_clone().map_err(LinkError::from_io)?;
    Ok((Box::new(TcpLink { stream }), Box::new(TcpLink { stream: writer })))
}

impl Transport for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match self.stream.read(buf) {
            Ok(0) => Err(LinkError::Closed),
            Ok(n) => Ok(n),
            Err(err) => Err(LinkError::from_io(err)),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        self.stream.write_all(buf).map_err(LinkError::from_io)
    }

    /// Peeks one byte without blocking. A peeked end-of-stream is how a
    /// closed peer first becomes visible on an otherwise idle link.
    fn bytes_available(&mut self) -> Result<usize, LinkError> {
        self.stream.set_nonblocking(true).map_err(LinkError::from_io)?;
        let peeked = self.stream.peek(&mut [0u8; 1]);
        self.stream.set_nonblocking(false).map_err(LinkError::from_io)?;
        match peeked {
            Ok(0) => Err(LinkError::Closed),
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(LinkError::from_io(err)),
        }
    }

    fn flush_input(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}
