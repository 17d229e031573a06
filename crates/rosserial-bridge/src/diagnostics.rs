//! Diagnostic status reports published when the link degrades.

/// Message used when a frame carries a version byte this bridge does not
/// speak. The device firmware and the bridge are from different releases, or
/// the stream lost sync in a way that survived the checksums.
pub const MSG_MISMATCHED_PROTOCOL: &str =
    "Mismatched protocol version in packet: lost sync or the device firmware \
     speaks a different rosserial release";
pub const MSG_NO_SYNC: &str = "no sync with device";
pub const MSG_PACKET_FAILED: &str = "Packet Failed : Failed to read msg data";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

/// One status entry of a diagnostics report, mirroring the middleware's
/// diagnostics message layout.
#[derive(Clone, Debug)]
pub struct DiagnosticStatus {
    pub name: String,
    pub level: DiagnosticLevel,
    pub message: String,
    /// Key/value detail pairs; the session reports the last-sync timestamps.
    pub values: Vec<(String, String)>,
}

pub trait DiagnosticsSink: Send + Sync {
    fn publish(&self, status: DiagnosticStatus);
}
