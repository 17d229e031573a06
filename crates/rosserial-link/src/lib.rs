//! Byte transports the bridge multiplexes rosserial sessions over: a serial
//! port, an accepted TCP stream, or a pinned UDP datagram flow. Each variant
//! opens into a read half and a write half over the same underlying link so
//! the session's read and write locks never contend on one object.

use std::os::fd::AsRawFd;

pub mod serial;
pub mod tcp;
pub mod udp;

pub use rosserial_proto::LinkError;

/// Kernel receive buffer requested on TCP and UDP sockets.
pub const RECV_BUFFER_SIZE: usize = 512 * 1024;

/// One half of a bidirectional byte link.
///
/// `read` performs a single bounded read honoring the link's configured
/// timeout; exact-length assembly with an overall deadline is the caller's
/// job. `write_all` is atomic per call. `bytes_available` is a best-effort
/// non-blocking hint; zero does not prove the link is idle.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
    fn write_all(&mut self, buf: &[u8]) -> Result<(), LinkError>;
    fn bytes_available(&mut self) -> Result<usize, LinkError>;
    /// Discards buffered input. A no-op where the kernel owns all buffering.
    fn flush_input(&mut self) -> Result<(), LinkError>;
}

/// Read and write halves of one opened link.
pub type TransportPair = (Box<dyn Transport>, Box<dyn Transport>);

/// Raises SO_RCVBUF on a socket. Failure is logged and ignored; an
/// undersized buffer degrades throughput but not correctness.
pub fn set_recv_buffer(sock: &impl AsRawFd, bytes: usize) {
    let fd = sock.as_raw_fd();
    let size = bytes as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            std::ptr::from_ref(&size).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::warn!(bytes, "couldn't raise socket receive buffer");
    }
}
