use std::io;

use thiserror::Error;

/// Error contract of the byte link the framing layer runs over.
///
/// `Closed` means the peer is gone and the session must end so the listener
/// can re-accept. `Timeout` is transient: no byte arrived within the
/// configured window.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link closed by peer")]
    Closed,
    #[error("link read timed out")]
    Timeout,
    #[error("link io error: {0}")]
    Io(io::Error),
}

impl LinkError {
    /// Folds an `io::Error` into the taxonomy. Timeout-class kinds map to
    /// `Timeout`, disconnect-class kinds to `Closed`, the rest stay `Io`.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(err),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        Self::from_io(err)
    }
}

/// Exact-read capability the frame decoder drives.
///
/// Implementations either fill the whole buffer or fail; a partial read must
/// surface as `Timeout` or `Closed`, never as silently short data.
pub trait FrameRead {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LinkError>;
}
