//! The per-device session: a reader loop that turns the link's byte stream
//! into dispatched frames, and a writer thread that drains the outbound
//! queue back onto the wire.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use rosserial_link::{Transport, TransportPair};
use rosserial_proto::{
    FrameEvent, FrameRead, LinkError, LogLevel, LogMsg, PROTOCOL_VER, ReadPhase,
    RequestParamRequest, RequestParamResponse, TimeMsg, TopicInfo, encode, ids, protocol_name,
    read_frame,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::SessionConfig,
    diagnostics::{
        DiagnosticLevel, DiagnosticStatus, MSG_MISMATCHED_PROTOCOL, MSG_NO_SYNC, MSG_PACKET_FAILED,
    },
    middleware::{BridgeContext, ParamValue},
    registry::{Registry, RegistryError, ServiceHalf},
    shutdown::ShutdownFlag,
};

/// Control frame requesting the device to enumerate its topics
/// (topic id 0, empty payload).
const REQUEST_TOPICS: [u8; 8] = [0xFF, 0xFE, 0x00, 0x00, 0xFF, 0x00, 0x00, 0xFF];
/// Control frame telling the device to stop transmitting
/// (topic id 11, empty payload).
const TX_STOP: [u8; 8] = [0xFF, 0xFE, 0x00, 0x00, 0xFF, 0x0B, 0x00, 0xF4];

const READ_LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_SLEEP: Duration = Duration::from_millis(1);
const WRITE_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Why a session returned.
#[derive(Debug)]
pub enum SessionEnd {
    /// The shutdown flag was observed; stop-tx has been queued.
    Shutdown,
    /// Previously synced, then nothing valid arrived within the sync budget.
    SyncLost,
    /// The writer thread stopped on a fatal write error.
    WriterStopped,
    /// A mid-frame link failure.
    Transport(LinkError),
}

/// Outbound queue entries. Control frames are pre-encoded; topic payloads
/// are framed by the writer so the negotiated buffer limit applies at write
/// time. `Shutdown` is the writer's stop sentinel, queued after stop-tx so
/// everything before it still reaches the wire.
pub(crate) enum WriteItem {
    Raw(Vec<u8>),
    Message { topic_id: u16, payload: Vec<u8> },
    Shutdown,
}

/// A monotonic instant paired with the wall time it happened at; the wall
/// side feeds diagnostics, the monotonic side feeds timeout arithmetic.
#[derive(Clone, Copy)]
struct Stamp {
    mono: Instant,
    wall: SystemTime,
}

impl Stamp {
    fn now() -> Self {
        Self { mono: Instant::now(), wall: SystemTime::now() }
    }
}

type SharedPort = Arc<Mutex<Box<dyn Transport>>>;
type SharedStamp = Arc<Mutex<Option<Stamp>>>;

/// Read-side view of the transport used by the frame decoder: every chunk is
/// read under the read lock, released between chunks so control paths can
/// flush input, with one overall deadline per exact read.
struct SharedReader {
    port: SharedPort,
    timeout: Duration,
    last_read: SharedStamp,
}

impl FrameRead for SharedReader {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LinkError> {
        let deadline = Instant::now() + self.timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let read = {
                let mut port = self.port.lock();
                port.read(&mut buf[filled..])
            };
            match read {
                Ok(n) => {
                    filled += n;
                    *self.last_read.lock() = Some(Stamp::now());
                }
                Err(err) if err.is_timeout() => {}
                Err(err) => return Err(err),
            }
            if filled < buf.len() && Instant::now() >= deadline {
                return Err(LinkError::Timeout);
            }
        }
        Ok(())
    }
}

pub struct Session {
    ctx: BridgeContext,
    cfg: SessionConfig,
    shutdown: ShutdownFlag,

    reader: SharedPort,
    writer: SharedPort,
    write_tx: Sender<WriteItem>,
    write_rx: Option<Receiver<WriteItem>>,
    registry: Registry,
    subscribe_buffer: Arc<AtomicU32>,

    synced: bool,
    last_sync: Option<Stamp>,
    last_sync_lost: Option<Stamp>,
    last_sync_success: Option<Stamp>,
    last_read: SharedStamp,
    last_write: SharedStamp,
}

impl Session {
    pub fn new(
        transport: TransportPair,
        ctx: BridgeContext,
        cfg: SessionConfig,
        shutdown: ShutdownFlag,
    ) -> Self {
        let (read_half, write_half) = transport;
        let (write_tx, write_rx) = unbounded();
        let publish_buffer = Arc::new(AtomicU32::new(0));
        let subscribe_buffer = Arc::new(AtomicU32::new(0));
        let registry = Registry::new(
            ctx.clone(),
            write_tx.clone(),
            cfg.service_timeout,
            publish_buffer,
            Arc::clone(&subscribe_buffer),
        );
        Self {
            ctx,
            cfg,
            shutdown,
            reader: Arc::new(Mutex::new(read_half)),
            writer: Arc::new(Mutex::new(write_half)),
            write_tx,
            write_rx: Some(write_rx),
            registry,
            subscribe_buffer,
            synced: false,
            last_sync: None,
            last_sync_lost: None,
            last_sync_success: None,
            last_read: Arc::new(Mutex::new(None)),
            last_write: Arc::new(Mutex::new(None)),
        }
    }

    /// Runs the session to completion: boot grace, topic negotiation, writer
    /// thread, reader loop, registry teardown.
    pub fn run(mut self) -> SessionEnd {
        // Give device boot-loaders a moment to hand the port over.
        thread::sleep(self.cfg.boot_grace);
        thread::sleep(self.cfg.negotiate_delay);
        self.request_topics();
        self.last_sync = Some(Stamp::now());

        let Some(write_rx) = self.write_rx.take() else {
            return SessionEnd::Shutdown;
        };
        let writer = {
            let port = Arc::clone(&self.writer);
            let buffer = Arc::clone(&self.subscribe_buffer);
            let shutdown = self.shutdown.clone();
            let last_write = Arc::clone(&self.last_write);
            let spawned = thread::Builder::new()
                .name("rosserial-writer".into())
                .spawn(move || writer_loop(&write_rx, &port, &buffer, &shutdown, &last_write));
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    error!(%err, "couldn't spawn writer thread");
                    return SessionEnd::Transport(LinkError::Io(err));
                }
            }
        };

        let mut shared = SharedReader {
            port: Arc::clone(&self.reader),
            timeout: self.cfg.link_timeout,
            last_read: Arc::clone(&self.last_read),
        };
        let end = self.reader_loop(&mut shared, &writer);

        let _ = self.write_tx.send(WriteItem::Shutdown);
        self.registry.teardown();
        if writer.join().is_err() {
            error!("writer thread panicked");
        }

        info!(
            ?end,
            synced = self.synced,
            last_valid_frame = %stamp_age(self.last_sync_success),
            last_read = %age(&self.last_read),
            last_write = %age(&self.last_write),
            "session ended"
        );
        end
    }

    fn reader_loop(&mut self, shared: &mut SharedReader, writer: &JoinHandle<()>) -> SessionEnd {
        loop {
            if self.shutdown.is_set() {
                self.tx_stop_request();
                return SessionEnd::Shutdown;
            }
            if writer.is_finished() {
                warn!("writer thread stopped, ending session");
                return SessionEnd::WriterStopped;
            }

            if let Some(last_sync) = self.last_sync {
                if last_sync.mono.elapsed() > self.cfg.link_timeout * 3 {
                    if self.synced {
                        error!("lost sync with device, ending session");
                        return SessionEnd::SyncLost;
                    }
                    error!(
                        "unable to sync with device; possible link problem or mismatched \
                         device firmware"
                    );
                    self.last_sync_lost = Some(Stamp::now());
                    self.send_diagnostics(DiagnosticLevel::Error, MSG_NO_SYNC);
                    self.request_topics();
                    self.last_sync = Some(Stamp::now());
                }
            }

            // Probe under the read lock; an idle link yields the CPU without
            // starving the writer half.
            {
                let Some(mut port) = self.reader.try_lock_for(READ_LOCK_TIMEOUT) else {
                    continue;
                };
                match port.bytes_available() {
                    Ok(0) => {
                        drop(port);
                        thread::sleep(IDLE_SLEEP);
                        continue;
                    }
                    Ok(_) => {}
                    Err(err) if err.is_timeout() => continue,
                    Err(err) => {
                        warn!(%err, "link probe failed, ending session");
                        return SessionEnd::Transport(err);
                    }
                }
            }

            match read_frame(shared) {
                Ok(FrameEvent::Frame { topic_id, payload }) => {
                    self.synced = true;
                    self.last_sync_success = Some(Stamp::now());
                    self.dispatch(topic_id, &payload);
                    thread::sleep(IDLE_SLEEP);
                }
                Ok(FrameEvent::ProtocolMismatch { version }) => {
                    self.send_diagnostics(DiagnosticLevel::Error, MSG_MISMATCHED_PROTOCOL);
                    error!(version, "{MSG_MISMATCHED_PROTOCOL}");
                    info!(
                        "protocol version of client is {}, expected {}",
                        protocol_name(version),
                        protocol_name(PROTOCOL_VER)
                    );
                }
                Err(err) => {
                    if err.phase == ReadPhase::Data {
                        self.send_diagnostics(DiagnosticLevel::Error, MSG_PACKET_FAILED);
                    }
                    warn!(phase = %err.phase, error = %err.source, "read failed, ending session");
                    return SessionEnd::Transport(err.source);
                }
            }
        }
    }

    fn dispatch(&mut self, topic_id: u16, payload: &[u8]) {
        match topic_id {
            ids::PUBLISHER => {
                self.install(payload, "publisher", |reg, info| reg.install_publisher(info));
            }
            ids::SUBSCRIBER => {
                self.install(payload, "subscriber", |reg, info| reg.install_subscriber(info));
            }
            ids::SERVICE_SERVER_RESPONSE => {
                self.install(payload, "service server", |reg, info| {
                    reg.install_service_server(info, ServiceHalf::Response)
                });
            }
            ids::SERVICE_SERVER_REQUEST => {
                self.install(payload, "service server", |reg, info| {
                    reg.install_service_server(info, ServiceHalf::Request)
                });
            }
            ids::SERVICE_CLIENT_REQUEST => {
                self.install(payload, "service client", |reg, info| {
                    reg.install_service_client(info, ServiceHalf::Request)
                });
            }
            ids::SERVICE_CLIENT_RESPONSE => {
                self.install(payload, "service client", |reg, info| {
                    reg.install_service_client(info, ServiceHalf::Response)
                });
            }
            ids::PARAMETER_REQUEST => self.handle_parameter_request(payload),
            ids::LOG => self.handle_log(payload),
            ids::TIME => self.handle_time_request(),
            id => {
                if !self.registry.handle(id, payload) {
                    error!(topic_id = id, "frame for unconfigured topic id, re-requesting topics");
                    self.request_topics();
                }
            }
        }
    }

    fn install(
        &mut self,
        payload: &[u8],
        kind: &str,
        install: impl FnOnce(&mut Registry, &TopicInfo) -> Result<(), RegistryError>,
    ) {
        let result = TopicInfo::decode(payload)
            .map_err(|err| err.to_string())
            .and_then(|info| install(&mut self.registry, &info).map_err(|err| err.to_string()));
        if let Err(err) = result {
            error!(%err, kind, "endpoint creation failed");
        }
    }

    /// Answers a time-sync request with the host wall clock. Doubles as the
    /// device's heartbeat: it refreshes the sync budget.
    fn handle_time_request(&mut self) {
        let now = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
        let time = TimeMsg { sec: now.as_secs() as u32, nsec: now.subsec_nanos() };
        self.send(ids::TIME, time.encode());
        self.last_sync = Some(Stamp::now());
    }

    fn handle_parameter_request(&mut self, payload: &[u8]) {
        let request = match RequestParamRequest::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                error!(%err, "handle parameter request failed");
                return;
            }
        };
        let response = match self.ctx.params.get(&request.name) {
            Some(value) => param_response(&request.name, &value),
            None => {
                error!(name = %request.name, "parameter does not exist");
                RequestParamResponse::default()
            }
        };
        self.send(ids::PARAMETER_REQUEST, response.encode());
    }

    /// Forwards a device log frame into the host log at the carried severity.
    fn handle_log(&self, payload: &[u8]) {
        const DEVICE: &str = "rosserial_bridge::device";
        match LogMsg::decode(payload) {
            Ok(log) => match LogLevel::from_wire(log.level) {
                Some(LogLevel::Debug) => debug!(target: DEVICE, "{}", log.msg),
                Some(LogLevel::Info) => info!(target: DEVICE, "{}", log.msg),
                Some(LogLevel::Warn) => warn!(target: DEVICE, "{}", log.msg),
                Some(LogLevel::Error) => error!(target: DEVICE, "{}", log.msg),
                Some(LogLevel::Fatal) => error!(target: DEVICE, fatal = true, "{}", log.msg),
                None => {
                    warn!(target: DEVICE, level = log.level, "device log with unrecognized level: {}", log.msg);
                }
            },
            Err(err) => error!(%err, "handling device log failed"),
        }
    }

    fn send(&self, topic_id: u16, payload: Vec<u8>) {
        let _ = self.write_tx.send(WriteItem::Message { topic_id, payload });
    }

    /// Flushes stale input and queues the request-topics control frame.
    fn request_topics(&self) {
        info!("requesting topics");
        {
            let mut port = self.reader.lock();
            let _ = port.flush_input();
        }
        let _ = self.write_tx.send(WriteItem::Raw(REQUEST_TOPICS.to_vec()));
    }

    fn tx_stop_request(&self) {
        info!("sending tx stop request");
        {
            let mut port = self.reader.lock();
            let _ = port.flush_input();
        }
        let _ = self.write_tx.send(WriteItem::Raw(TX_STOP.to_vec()));
    }

    fn send_diagnostics(&self, level: DiagnosticLevel, message: &str) {
        let stamp_str = |stamp: Option<Stamp>| {
            stamp.map_or_else(
                || "never".to_string(),
                |s| humantime::format_rfc3339_seconds(s.wall).to_string(),
            )
        };
        self.ctx.diagnostics.publish(DiagnosticStatus {
            name: "rosserial".to_string(),
            level,
            message: message.to_string(),
            values: vec![
                ("last sync".to_string(), stamp_str(self.last_sync)),
                ("last sync lost".to_string(), stamp_str(self.last_sync_lost)),
            ],
        });
    }
}

fn stamp_age(stamp: Option<Stamp>) -> String {
    stamp.map_or_else(
        || "never".to_string(),
        |s| {
            let secs = Duration::from_secs(s.mono.elapsed().as_secs());
            format!("{} ago", humantime::format_duration(secs))
        },
    )
}

fn age(stamp: &SharedStamp) -> String {
    stamp_age(*stamp.lock())
}

fn writer_loop(
    rx: &Receiver<WriteItem>,
    port: &SharedPort,
    subscribe_buffer: &AtomicU32,
    shutdown: &ShutdownFlag,
    last_write: &SharedStamp,
) {
    loop {
        match rx.recv() {
            Ok(WriteItem::Shutdown) | Err(_) => break,
            Ok(WriteItem::Raw(frame)) => {
                if !write_frame(&frame, port, shutdown, last_write) {
                    break;
                }
            }
            Ok(WriteItem::Message { topic_id, payload }) => {
                match encode(topic_id, &payload, subscribe_buffer.load(Ordering::Acquire)) {
                    Ok(frame) => {
                        if !write_frame(&frame, port, shutdown, last_write) {
                            break;
                        }
                    }
                    // Oversize messages are dropped, not re-queued.
                    Err(err) => error!(%err, topic_id, "dropping message from middleware"),
                }
            }
        }
    }
    debug!("writer thread exiting");
}

/// Writes one frame under the write lock. Write timeouts are treated as the
/// device being momentarily busy and retried after a pause; anything else is
/// fatal to the writer. Returns false when the writer should stop.
fn write_frame(
    frame: &[u8],
    port: &SharedPort,
    shutdown: &ShutdownFlag,
    last_write: &SharedStamp,
) -> bool {
    loop {
        let written = {
            let mut port = port.lock();
            port.write_all(frame)
        };
        match written {
            Ok(()) => {
                *last_write.lock() = Some(Stamp::now());
                return true;
            }
            Err(LinkError::Timeout) => {
                error!("write timed out, retrying");
                thread::sleep(WRITE_RETRY_PAUSE);
                if shutdown.is_set() {
                    return false;
                }
            }
            Err(err) => {
                error!(%err, "write failed, stopping writer");
                return false;
            }
        }
    }
}

/// Maps a parameter-store value onto the typed arrays of the wire response.
/// Dictionaries, heterogeneous lists and nested lists cannot be represented;
/// they log an error and yield an empty response.
fn param_response(name: &str, value: &ParamValue) -> RequestParamResponse {
    let mut response = RequestParamResponse::default();
    let items: &[ParamValue] = match value {
        ParamValue::Map => {
            error!(name, "cannot send dictionary parameter");
            return response;
        }
        ParamValue::List(items) => items,
        scalar => std::slice::from_ref(scalar),
    };
    let Some(first) = items.first() else {
        return response;
    };
    let homogeneous =
        items.iter().all(|v| std::mem::discriminant(v) == std::mem::discriminant(first));
    if !homogeneous {
        error!(name, "all parameters in a list must be of the same type");
        return response;
    }
    match first {
        ParamValue::Bool(_) => {
            response.ints = items
                .iter()
                .filter_map(|v| match v {
                    ParamValue::Bool(b) => Some(i32::from(*b)),
                    _ => None,
                })
                .collect();
        }
        ParamValue::Int(_) => {
            response.ints = items
                .iter()
                .filter_map(|v| match v {
                    ParamValue::Int(i) => Some(*i as i32),
                    _ => None,
                })
                .collect();
        }
        ParamValue::Float(_) => {
            response.floats = items
                .iter()
                .filter_map(|v| match v {
                    ParamValue::Float(f) => Some(*f as f32),
                    _ => None,
                })
                .collect();
        }
        ParamValue::Str(_) => {
            response.strings = items
                .iter()
                .filter_map(|v| match v {
                    ParamValue::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
        }
        ParamValue::List(_) | ParamValue::Map => {
            error!(name, "nested parameter lists are not supported");
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_params_become_singleton_arrays() {
        let resp = param_response("n", &ParamValue::Int(5));
        assert_eq!(resp.ints, [5]);
        let resp = param_response("s", &ParamValue::Str("x".into()));
        assert_eq!(resp.strings, ["x"]);
        let resp = param_response("f", &ParamValue::Float(1.5));
        assert_eq!(resp.floats, [1.5]);
    }

    #[test]
    fn bools_are_sent_as_ints() {
        let list = ParamValue::List(vec![ParamValue::Bool(true), ParamValue::Bool(false)]);
        assert_eq!(param_response("flags", &list).ints, [1, 0]);
    }

    #[test]
    fn unrepresentable_params_yield_empty_response() {
        assert_eq!(param_response("d", &ParamValue::Map), RequestParamResponse::default());

        let mixed = ParamValue::List(vec![ParamValue::Int(1), ParamValue::Str("x".into())]);
        assert_eq!(param_response("m", &mixed), RequestParamResponse::default());

        let nested = ParamValue::List(vec![ParamValue::List(vec![])]);
        assert_eq!(param_response("n", &nested), RequestParamResponse::default());

        assert_eq!(
            param_response("e", &ParamValue::List(vec![])),
            RequestParamResponse::default()
        );
    }
}
