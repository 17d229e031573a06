//! In-memory doubles for the transport and the host-side collaborators,
//! used by this crate's tests and handy for embedders testing their own
//! bindings.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use parking_lot::Mutex;
use rosserial_link::{Transport, TransportPair};
use rosserial_proto::LinkError;

use crate::{
    diagnostics::{DiagnosticStatus, DiagnosticsSink},
    middleware::{
        BridgeContext, DynMessage, MessageClass, Middleware, MiddlewareError, ParamValue,
        ParameterStore, Publication, ServiceClass, ServiceFn, ServiceProxy, ServiceRegistration,
        SubscriberFn, Subscription, TypeRegistry,
    },
};

// ---------------------------------------------------------------------------
// scripted link

/// Test-side handle of a [`scripted_link`]: feeds inbound bytes and captures
/// every `write_all` the session performs.
pub struct LinkHarness {
    inbound: Sender<Vec<u8>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl LinkHarness {
    pub fn push_bytes(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.inbound.send(bytes.into());
    }

    /// Frames `payload` and feeds it to the session as device traffic.
    pub fn push_frame(&self, topic_id: u16, payload: &[u8]) {
        self.push_bytes(rosserial_proto::encode(topic_id, payload, 0).expect("frame"));
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    /// Polls until the session has performed at least `count` writes.
    /// Panics on timeout so a stuck test fails with the captured writes.
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let writes = self.writes();
            if writes.len() >= count {
                return writes;
            }
            assert!(
                Instant::now() < deadline,
                "expected {count} writes, got {writes:x?}"
            );
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

struct ScriptedRead {
    inbound: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl ScriptedRead {
    fn refill(&mut self) -> Result<(), LinkError> {
        loop {
            match self.inbound.try_recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return if self.pending.is_empty() { Err(LinkError::Closed) } else { Ok(()) };
                }
            }
        }
    }
}

impl Transport for ScriptedRead {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if self.pending.is_empty() {
            match self.inbound.recv_timeout(Duration::from_millis(20)) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => return Err(LinkError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(LinkError::Closed),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write_all(&mut self, _buf: &[u8]) -> Result<(), LinkError> {
        Err(LinkError::Io(std::io::Error::other("write on read half")))
    }

    fn bytes_available(&mut self) -> Result<usize, LinkError> {
        self.refill()?;
        Ok(self.pending.len())
    }

    fn flush_input(&mut self) -> Result<(), LinkError> {
        self.pending.clear();
        Ok(())
    }
}

struct ScriptedWrite {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Transport for ScriptedWrite {
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, LinkError> {
        Err(LinkError::Timeout)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        self.written.lock().push(buf.to_vec());
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, LinkError> {
        Ok(0)
    }

    fn flush_input(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}

/// A fully scripted transport pair plus its test harness.
pub fn scripted_link() -> (TransportPair, LinkHarness) {
    let (inbound, rx) = unbounded();
    let written = Arc::new(Mutex::new(Vec::new()));
    let pair: TransportPair = (
        Box::new(ScriptedRead { inbound: rx, pending: Vec::new() }),
        Box::new(ScriptedWrite { written: Arc::clone(&written) }),
    );
    (pair, LinkHarness { inbound, written })
}

// ---------------------------------------------------------------------------
// type registry

/// Message codec that hands serialized bytes through untouched; good enough
/// for a bridge test that never inspects message contents.
struct RawClass {
    type_name: String,
    md5: String,
}

impl MessageClass for RawClass {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn md5sum(&self) -> &str {
        &self.md5
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<DynMessage, MiddlewareError> {
        Ok(Box::new(bytes.to_vec()))
    }

    fn serialize(&self, msg: &DynMessage) -> Result<Vec<u8>, MiddlewareError> {
        msg.downcast_ref::<Vec<u8>>()
            .cloned()
            .ok_or_else(|| MiddlewareError::Codec("expected raw byte message".into()))
    }
}

fn raw_bytes(msg: DynMessage) -> Result<Vec<u8>, MiddlewareError> {
    msg.downcast::<Vec<u8>>()
        .map(|b| *b)
        .map_err(|_| MiddlewareError::Codec("expected raw byte message".into()))
}

/// Pre-populated type registry of byte-passthrough codecs.
#[derive(Default)]
pub struct StaticTypes {
    messages: HashMap<String, Arc<dyn MessageClass>>,
    services: HashMap<String, ServiceClass>,
}

impl StaticTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, full_type: &str, md5: &str) -> Self {
        self.messages.insert(
            full_type.to_string(),
            Arc::new(RawClass { type_name: full_type.to_string(), md5: md5.to_string() }),
        );
        self
    }

    pub fn with_service(mut self, full_type: &str, request_md5: &str, response_md5: &str) -> Self {
        self.services.insert(
            full_type.to_string(),
            ServiceClass {
                type_name: full_type.to_string(),
                request: Arc::new(RawClass {
                    type_name: format!("{full_type}Request"),
                    md5: request_md5.to_string(),
                }),
                response: Arc::new(RawClass {
                    type_name: format!("{full_type}Response"),
                    md5: response_md5.to_string(),
                }),
            },
        );
        self
    }
}

impl TypeRegistry for StaticTypes {
    fn resolve_message(
        &self,
        package: &str,
        name: &str,
    ) -> Result<Arc<dyn MessageClass>, MiddlewareError> {
        self.messages.get(&format!("{package}/{name}")).cloned().ok_or_else(|| {
            MiddlewareError::UnknownType { package: package.to_string(), name: name.to_string() }
        })
    }

    fn resolve_service(&self, package: &str, name: &str) -> Result<ServiceClass, MiddlewareError> {
        self.services.get(&format!("{package}/{name}")).cloned().ok_or_else(|| {
            MiddlewareError::UnknownType { package: package.to_string(), name: name.to_string() }
        })
    }
}

// ---------------------------------------------------------------------------
// middleware

struct SubscriptionEntry {
    callback: SubscriberFn,
}

struct ServiceEntry {
    callback: ServiceFn,
}

#[derive(Default)]
struct MemoryInner {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<HashMap<String, Arc<SubscriptionEntry>>>,
    services: Mutex<HashMap<String, Arc<ServiceEntry>>>,
    proxy_calls: Mutex<Vec<(String, Vec<u8>)>>,
}

/// Recording middleware double. Publications land in a log, subscriber and
/// service callbacks can be driven from the test, and service proxies echo
/// the request bytes back as the response.
#[derive(Clone, Default)]
pub struct MemoryMiddleware(Arc<MemoryInner>);

impl MemoryMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far as `(topic, serialized bytes)`.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.0.published.lock().clone()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.0.subscriptions.lock().contains_key(topic)
    }

    pub fn has_service(&self, topic: &str) -> bool {
        self.0.services.lock().contains_key(topic)
    }

    /// Drives the subscriber callback for `topic` with a raw byte message.
    /// Returns false when nothing is subscribed.
    pub fn deliver(&self, topic: &str, bytes: &[u8]) -> bool {
        let entry = self.0.subscriptions.lock().get(topic).cloned();
        match entry {
            Some(entry) => {
                (entry.callback)(Box::new(bytes.to_vec()));
                true
            }
            None => false,
        }
    }

    /// Invokes a registered service server the way a middleware caller
    /// would. Blocks until the bridge produces the response.
    pub fn call_service(&self, topic: &str, request: &[u8]) -> Result<Vec<u8>, MiddlewareError> {
        let entry = self
            .0
            .services
            .lock()
            .get(topic)
            .cloned()
            .ok_or_else(|| MiddlewareError::Rejected(format!("no service {topic}")))?;
        raw_bytes((entry.callback)(Box::new(request.to_vec()))?)
    }

    /// Requests the device's service-client proxies answered, in call order.
    pub fn proxy_calls(&self) -> Vec<(String, Vec<u8>)> {
        self.0.proxy_calls.lock().clone()
    }
}

struct MemoryPublication {
    topic: String,
    inner: Arc<MemoryInner>,
}

impl Publication for MemoryPublication {
    fn publish(&self, msg: DynMessage) -> Result<(), MiddlewareError> {
        let bytes = raw_bytes(msg)?;
        self.inner.published.lock().push((self.topic.clone(), bytes));
        Ok(())
    }
}

struct MemorySubscription {
    topic: String,
    inner: Arc<MemoryInner>,
    active: AtomicBool,
}

impl Subscription for MemorySubscription {
    fn unregister(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.inner.subscriptions.lock().remove(&self.topic);
        }
    }
}

struct MemoryServiceRegistration {
    topic: String,
    inner: Arc<MemoryInner>,
    active: AtomicBool,
}

impl ServiceRegistration for MemoryServiceRegistration {
    fn shutdown(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.inner.services.lock().remove(&self.topic);
        }
    }
}

struct EchoProxy {
    topic: String,
    inner: Arc<MemoryInner>,
}

impl ServiceProxy for EchoProxy {
    fn call(&self, request: DynMessage) -> Result<DynMessage, MiddlewareError> {
        let bytes = raw_bytes(request)?;
        self.inner.proxy_calls.lock().push((self.topic.clone(), bytes.clone()));
        Ok(Box::new(bytes))
    }
}

impl Middleware for MemoryMiddleware {
    fn publisher(
        &self,
        topic: &str,
        _class: &Arc<dyn MessageClass>,
    ) -> Result<Box<dyn Publication>, MiddlewareError> {
        Ok(Box::new(MemoryPublication { topic: topic.to_string(), inner: Arc::clone(&self.0) }))
    }

    fn subscriber(
        &self,
        topic: &str,
        _class: &Arc<dyn MessageClass>,
        callback: SubscriberFn,
    ) -> Result<Box<dyn Subscription>, MiddlewareError> {
        self.0
            .subscriptions
            .lock()
            .insert(topic.to_string(), Arc::new(SubscriptionEntry { callback }));
        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            inner: Arc::clone(&self.0),
            active: AtomicBool::new(true),
        }))
    }

    fn service_server(
        &self,
        topic: &str,
        _class: &ServiceClass,
        callback: ServiceFn,
    ) -> Result<Box<dyn ServiceRegistration>, MiddlewareError> {
        self.0.services.lock().insert(topic.to_string(), Arc::new(ServiceEntry { callback }));
        Ok(Box::new(MemoryServiceRegistration {
            topic: topic.to_string(),
            inner: Arc::clone(&self.0),
            active: AtomicBool::new(true),
        }))
    }

    fn service_proxy(
        &self,
        topic: &str,
        _class: &ServiceClass,
    ) -> Result<Box<dyn ServiceProxy>, MiddlewareError> {
        Ok(Box::new(EchoProxy { topic: topic.to_string(), inner: Arc::clone(&self.0) }))
    }
}

// ---------------------------------------------------------------------------
// parameter store / diagnostics

#[derive(Default)]
pub struct MemoryParams(Mutex<HashMap<String, ParamValue>>);

impl MemoryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: ParamValue) {
        self.0.lock().insert(name.to_string(), value);
    }
}

impl ParameterStore for MemoryParams {
    fn get(&self, name: &str) -> Option<ParamValue> {
        self.0.lock().get(name).cloned()
    }
}

#[derive(Default)]
pub struct MemoryDiagnostics(Mutex<Vec<DiagnosticStatus>>);

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<DiagnosticStatus> {
        self.0.lock().clone()
    }
}

impl DiagnosticsSink for MemoryDiagnostics {
    fn publish(&self, status: DiagnosticStatus) {
        self.0.lock().push(status);
    }
}

// ---------------------------------------------------------------------------

/// The full set of host-side doubles behind one [`BridgeContext`].
pub struct MemoryHost {
    pub middleware: MemoryMiddleware,
    pub params: Arc<MemoryParams>,
    pub diagnostics: Arc<MemoryDiagnostics>,
    types: Arc<StaticTypes>,
}

impl MemoryHost {
    pub fn new(types: StaticTypes) -> Self {
        Self {
            middleware: MemoryMiddleware::new(),
            params: Arc::new(MemoryParams::new()),
            diagnostics: Arc::new(MemoryDiagnostics::new()),
            types: Arc::new(types),
        }
    }

    pub fn context(&self) -> BridgeContext {
        BridgeContext {
            middleware: Arc::new(self.middleware.clone()),
            types: Arc::clone(&self.types) as Arc<dyn TypeRegistry>,
            params: Arc::clone(&self.params) as Arc<dyn ParameterStore>,
            diagnostics: Arc::clone(&self.diagnostics) as Arc<dyn DiagnosticsSink>,
        }
    }
}
