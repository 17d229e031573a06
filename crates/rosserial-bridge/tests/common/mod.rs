//! Shared scaffolding for the session integration tests: a session running
//! over a scripted link, with timeouts shrunk to test scale.

// Each test binary uses its own subset of this module.
#![allow(dead_code)]

use std::{
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use rosserial_bridge::{
    Session, SessionEnd, ShutdownFlag,
    config::SessionConfig,
    testing::{LinkHarness, MemoryHost, StaticTypes, scripted_link},
};

pub const REQUEST_TOPICS: [u8; 8] = [0xFF, 0xFE, 0x00, 0x00, 0xFF, 0x00, 0x00, 0xFF];
pub const TX_STOP: [u8; 8] = [0xFF, 0xFE, 0x00, 0x00, 0xFF, 0x0B, 0x00, 0xF4];

pub const STRING_MD5: &str = "992ce8a1687cec8c8bd883ec73ca41d1";
pub const REQ_MD5: &str = "aaaa0000aaaa0000aaaa0000aaaa0000";
pub const RESP_MD5: &str = "bbbb1111bbbb1111bbbb1111bbbb1111";

pub fn test_config() -> SessionConfig {
    SessionConfig {
        link_timeout: Duration::from_secs(2),
        boot_grace: Duration::ZERO,
        negotiate_delay: Duration::ZERO,
        service_timeout: Duration::from_millis(500),
    }
}

pub struct RunningSession {
    pub harness: LinkHarness,
    pub host: MemoryHost,
    shutdown: ShutdownFlag,
    handle: JoinHandle<SessionEnd>,
}

impl RunningSession {
    pub fn start(types: StaticTypes) -> Self {
        let host = MemoryHost::new(types);
        let (pair, harness) = scripted_link();
        let shutdown = ShutdownFlag::new();
        let session = Session::new(pair, host.context(), test_config(), shutdown.clone());
        let handle = thread::spawn(move || session.run());
        Self { harness, host, shutdown, handle }
    }

    /// Signals shutdown and returns how the session ended.
    pub fn stop(self) -> (SessionEnd, LinkHarness) {
        self.shutdown.signal();
        let end = self.handle.join().expect("session thread panicked");
        (end, self.harness)
    }
}

/// Polls `condition` until it holds or the timeout elapses.
pub fn wait_until(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Splits a captured write back into `(topic_id, payload)`.
pub fn parse_frame(frame: &[u8]) -> (u16, Vec<u8>) {
    assert!(frame.len() >= 8, "short frame: {frame:x?}");
    assert_eq!(frame[0], 0xFF);
    assert_eq!(frame[1], 0xFE);
    let len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
    let topic_id = u16::from_le_bytes([frame[5], frame[6]]);
    (topic_id, frame[7..7 + len].to_vec())
}
