//! UART transport over the `serialport` crate.

use std::{
    io::{Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, SerialPort};
use tracing::debug;

use crate::{LinkError, Transport, TransportPair};

fn from_serial(err: serialport::Error) -> LinkError {
    match err.kind() {
        serialport::ErrorKind::Io(kind) => LinkError::from_io(kind.into()),
        _ => LinkError::Io(std::io::Error::other(err.to_string())),
    }
}

/// One half of an open serial port. Both halves share the underlying tty.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

/// Opens `path` at `baud` with `timeout` applied to each read and write
/// call, returning the read and write halves.
pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<TransportPair, LinkError> {
    let port = serialport::new(path, baud).timeout(timeout).open().map_err(from_serial)?;
    let writer = port.try_clone().map_err(from_serial)?;
    debug!(path, baud, "serial port open");
    Ok((Box::new(SerialLink { port }), Box::new(SerialLink { port: writer })))
}

impl Transport for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match self.port.read(buf) {
            // Some tty drivers report an expired timeout as a zero-length
            // read instead of an error.
            Ok(0) => Err(LinkError::Timeout),
            Ok(n) => Ok(n),
            Err(err) => Err(LinkError::from_io(err)),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        self.port.write_all(buf).map_err(LinkError::from_io)
    }

    fn bytes_available(&mut self) -> Result<usize, LinkError> {
        self.port.bytes_to_read().map(|n| n as usize).map_err(from_serial)
    }

    fn flush_input(&mut self) -> Result<(), LinkError> {
        self.port.clear(ClearBuffer::Input).map_err(from_serial)
    }
}
