//! The endpoint registry: binds the topic ids a device announces to
//! middleware publishers, subscribers and service endpoints, and dispatches
//! inbound payloads to them.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU16, AtomicU32, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;
use rosserial_proto::TopicInfo;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    middleware::{
        BridgeContext, DynMessage, MessageClass, MiddlewareError, Publication, ServiceClass,
        ServiceProxy, ServiceRegistration, Subscription,
    },
    session::WriteItem,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("checksum does not match: {expected}, {announced}")]
    ChecksumMismatch { expected: String, announced: String },
    #[error("malformed message type {0:?}, expected \"package/Type\"")]
    MalformedType(String),
    #[error("topic id {id} already bound to {existing} with a different checksum")]
    TopicIdReuse { id: u16, existing: String },
    #[error("topic {0:?} already negotiated as a different endpoint kind")]
    EndpointKindMismatch(String),
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
}

/// Which side of a service the device is announcing. The request half
/// carries the id the bridge writes requests (or receives them) on; the
/// response half carries the opposite direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceHalf {
    Request,
    Response,
}

fn check_md5(class: &dyn MessageClass, info: &TopicInfo) -> Result<(), RegistryError> {
    if class.md5sum() == info.md5sum {
        Ok(())
    } else {
        Err(RegistryError::ChecksumMismatch {
            expected: class.md5sum().to_string(),
            announced: info.md5sum.clone(),
        })
    }
}

fn split_type(info: &TopicInfo) -> Result<(&str, &str), RegistryError> {
    info.split_message_type().ok_or_else(|| RegistryError::MalformedType(info.message_type.clone()))
}

struct PublisherEndpoint {
    topic_name: String,
    class: Arc<dyn MessageClass>,
    publication: Box<dyn Publication>,
}

struct SubscriberEndpoint {
    topic_id: u16,
    class: Arc<dyn MessageClass>,
    handle: Box<dyn Subscription>,
}

/// Bridged service hosted on the device and offered to the middleware.
///
/// The middleware callback serializes the request, queues it for the device
/// and parks on a one-shot channel; the response-half inbound handler fills
/// that channel when the device answers.
struct ServiceServerState {
    topic_name: String,
    class: ServiceClass,
    /// Device-bound topic id, learned from the request half. Zero until then.
    request_id: AtomicU16,
    pending: Mutex<Option<Sender<DynMessage>>>,
    timeout: Duration,
    write_tx: Sender<WriteItem>,
}

impl ServiceServerState {
    fn call(&self, request: DynMessage) -> Result<DynMessage, MiddlewareError> {
        let topic_id = self.request_id.load(Ordering::Acquire);
        if topic_id == 0 {
            return Err(MiddlewareError::Rejected(format!(
                "service {} request channel not negotiated yet",
                self.topic_name
            )));
        }
        let payload = self.class.request.serialize(&request)?;

        let (tx, rx) = bounded(1);
        *self.pending.lock() = Some(tx);
        let _ = self.write_tx.send(WriteItem::Message { topic_id, payload });

        match rx.recv_timeout(self.timeout) {
            Ok(response) => Ok(response),
            Err(_) => {
                self.pending.lock().take();
                Err(MiddlewareError::ServiceTimeout)
            }
        }
    }

    fn complete(&self, payload: &[u8]) {
        match self.class.response.deserialize(payload) {
            Ok(response) => match self.pending.lock().take() {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => warn!(topic = %self.topic_name, "service response with no caller waiting"),
            },
            Err(err) => error!(topic = %self.topic_name, %err, "service server handling packet failed"),
        }
    }
}

/// Bridged service hosted in the middleware and invoked by the device.
struct ServiceClientState {
    topic_name: String,
    class: ServiceClass,
    proxy: Box<dyn ServiceProxy>,
    /// Device-bound topic id for responses, learned from the response half.
    response_id: AtomicU16,
    write_tx: Sender<WriteItem>,
}

impl ServiceClientState {
    /// Runs one device request through the middleware proxy. Blocks the
    /// reader for the duration of the call, like every inbound handler.
    fn handle_request(&self, payload: &[u8]) {
        let outcome = self
            .class
            .request
            .deserialize(payload)
            .and_then(|req| self.proxy.call(req))
            .and_then(|resp| self.class.response.serialize(&resp));
        match outcome {
            Ok(payload) => {
                let topic_id = self.response_id.load(Ordering::Acquire);
                if topic_id == 0 {
                    warn!(topic = %self.topic_name, "dropping service response, channel not negotiated");
                    return;
                }
                let _ = self.write_tx.send(WriteItem::Message { topic_id, payload });
            }
            Err(err) => error!(topic = %self.topic_name, %err, "service client handling packet failed"),
        }
    }
}

enum ServiceEndpoint {
    Server { state: Arc<ServiceServerState>, registration: Box<dyn ServiceRegistration> },
    Client(Arc<ServiceClientState>),
}

enum Handler {
    Publish,
    ServiceResponse(Arc<ServiceServerState>),
    ServiceRequest(Arc<ServiceClientState>),
}

pub struct Registry {
    ctx: BridgeContext,
    write_tx: Sender<WriteItem>,
    service_timeout: Duration,

    publishers: HashMap<u16, PublisherEndpoint>,
    subscribers: HashMap<String, SubscriberEndpoint>,
    services: HashMap<String, ServiceEndpoint>,
    handlers: HashMap<u16, Handler>,

    /// Device's publish buffer (device→host), learned from the first
    /// announcement. Zero until negotiated.
    publish_buffer: Arc<AtomicU32>,
    /// Device's subscribe buffer (host→device); the writer drops anything
    /// larger. Zero until negotiated.
    subscribe_buffer: Arc<AtomicU32>,
}

impl Registry {
    pub(crate) fn new(
        ctx: BridgeContext,
        write_tx: Sender<WriteItem>,
        service_timeout: Duration,
        publish_buffer: Arc<AtomicU32>,
        subscribe_buffer: Arc<AtomicU32>,
    ) -> Self {
        Self {
            ctx,
            write_tx,
            service_timeout,
            publishers: HashMap::new(),
            subscribers: HashMap::new(),
            services: HashMap::new(),
            handlers: HashMap::new(),
            publish_buffer,
            subscribe_buffer,
        }
    }

    fn set_publish_size(&self, bytes: u32) {
        if bytes > 0
            && self.publish_buffer.compare_exchange(0, bytes, Ordering::AcqRel, Ordering::Acquire).is_ok()
        {
            info!(bytes, "device publish buffer size");
        }
    }

    fn set_subscribe_size(&self, bytes: u32) {
        if bytes > 0
            && self
                .subscribe_buffer
                .compare_exchange(0, bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            info!(bytes, "device subscribe buffer size");
        }
    }

    /// Creates a middleware publisher for a device-announced topic and binds
    /// its id to an inbound forwarding handler.
    pub fn install_publisher(&mut self, info: &TopicInfo) -> Result<(), RegistryError> {
        let (package, name) = split_type(info)?;
        let class = self.ctx.types.resolve_message(package, name)?;
        check_md5(class.as_ref(), info)?;

        if let Some(existing) = self.publishers.get(&info.topic_id) {
            if existing.class.md5sum() != class.md5sum() {
                return Err(RegistryError::TopicIdReuse {
                    id: info.topic_id,
                    existing: existing.topic_name.clone(),
                });
            }
        } else {
            info!(topic = %info.topic_name, ty = %info.message_type, "setup publisher");
        }

        let publication = self.ctx.middleware.publisher(&info.topic_name, &class)?;
        self.publishers.insert(
            info.topic_id,
            PublisherEndpoint { topic_name: info.topic_name.clone(), class, publication },
        );
        self.handlers.insert(info.topic_id, Handler::Publish);
        self.set_publish_size(info.buffer_size);
        Ok(())
    }

    /// Subscribes to a middleware topic on the device's behalf. Announcing
    /// the same topic with the same type again is a no-op; announcing it with
    /// a new type unregisters the old subscription first. The swap is
    /// best-effort: a delivery of the old type already in flight may still
    /// reach the old callback while the new one is installed.
    pub fn install_subscriber(&mut self, info: &TopicInfo) -> Result<(), RegistryError> {
        let same_type = self
            .subscribers
            .get(&info.topic_name)
            .is_some_and(|existing| existing.class.type_name() == info.message_type);
        if same_type {
            return Ok(());
        }
        if let Some(mut existing) = self.subscribers.remove(&info.topic_name) {
            info!(
                topic = %info.topic_name,
                old = %existing.class.type_name(),
                new = %info.message_type,
                "changing subscriber message type"
            );
            existing.handle.unregister();
        }

        let (package, name) = split_type(info)?;
        let class = self.ctx.types.resolve_message(package, name)?;
        check_md5(class.as_ref(), info)?;

        let topic_id = info.topic_id;
        let topic_name = info.topic_name.clone();
        let forward_class = Arc::clone(&class);
        let write_tx = self.write_tx.clone();
        let handle = self.ctx.middleware.subscriber(
            &info.topic_name,
            &class,
            Box::new(move |msg| match forward_class.serialize(&msg) {
                Ok(payload) => {
                    let _ = write_tx.send(WriteItem::Message { topic_id, payload });
                }
                Err(err) => error!(topic = %topic_name, %err, "subscriber callback failed"),
            }),
        )?;

        info!(topic = %info.topic_name, ty = %info.message_type, "setup subscriber");
        self.subscribers
            .insert(info.topic_name.clone(), SubscriberEndpoint { topic_id, class, handle });
        self.set_subscribe_size(info.buffer_size);
        Ok(())
    }

    fn service_server_state(
        &mut self,
        info: &TopicInfo,
    ) -> Result<Arc<ServiceServerState>, RegistryError> {
        if let Some(endpoint) = self.services.get(&info.topic_name) {
            return match endpoint {
                ServiceEndpoint::Server { state, .. } => Ok(Arc::clone(state)),
                ServiceEndpoint::Client(_) => {
                    Err(RegistryError::EndpointKindMismatch(info.topic_name.clone()))
                }
            };
        }

        let (package, name) = split_type(info)?;
        let class = self.ctx.types.resolve_service(package, name)?;
        let state = Arc::new(ServiceServerState {
            topic_name: info.topic_name.clone(),
            class,
            request_id: AtomicU16::new(0),
            pending: Mutex::new(None),
            timeout: self.service_timeout,
            write_tx: self.write_tx.clone(),
        });

        let callback_state = Arc::clone(&state);
        let registration = self.ctx.middleware.service_server(
            &info.topic_name,
            &state.class,
            Box::new(move |req| callback_state.call(req)),
        )?;

        info!(topic = %info.topic_name, ty = %info.message_type, "setup service server");
        self.services.insert(
            info.topic_name.clone(),
            ServiceEndpoint::Server { state: Arc::clone(&state), registration },
        );
        Ok(state)
    }

    /// Installs one half of a device-hosted service. The response half binds
    /// the announced id to the completion handler; the request half records
    /// the id outbound requests are framed with.
    pub fn install_service_server(
        &mut self,
        info: &TopicInfo,
        half: ServiceHalf,
    ) -> Result<(), RegistryError> {
        match half {
            ServiceHalf::Response => self.set_publish_size(info.buffer_size),
            ServiceHalf::Request => self.set_subscribe_size(info.buffer_size),
        }
        let state = self.service_server_state(info)?;
        match half {
            ServiceHalf::Response => {
                check_md5(state.class.response.as_ref(), info)?;
                self.handlers.insert(info.topic_id, Handler::ServiceResponse(state));
            }
            ServiceHalf::Request => {
                check_md5(state.class.request.as_ref(), info)?;
                state.request_id.store(info.topic_id, Ordering::Release);
            }
        }
        Ok(())
    }

    fn service_client_state(
        &mut self,
        info: &TopicInfo,
    ) -> Result<Arc<ServiceClientState>, RegistryError> {
        if let Some(endpoint) = self.services.get(&info.topic_name) {
            return match endpoint {
                ServiceEndpoint::Client(state) => Ok(Arc::clone(state)),
                ServiceEndpoint::Server { .. } => {
                    Err(RegistryError::EndpointKindMismatch(info.topic_name.clone()))
                }
            };
        }

        let (package, name) = split_type(info)?;
        let class = self.ctx.types.resolve_service(package, name)?;
        info!(topic = %info.topic_name, "starting service client, waiting for service");
        let proxy = self.ctx.middleware.service_proxy(&info.topic_name, &class)?;
        let state = Arc::new(ServiceClientState {
            topic_name: info.topic_name.clone(),
            class,
            proxy,
            response_id: AtomicU16::new(0),
            write_tx: self.write_tx.clone(),
        });

        info!(topic = %info.topic_name, ty = %info.message_type, "setup service client");
        self.services.insert(info.topic_name.clone(), ServiceEndpoint::Client(Arc::clone(&state)));
        Ok(state)
    }

    /// Installs one half of a middleware-hosted service the device calls.
    /// The request half binds the announced id to the proxy-invoking handler;
    /// the response half records the id replies are framed with.
    pub fn install_service_client(
        &mut self,
        info: &TopicInfo,
        half: ServiceHalf,
    ) -> Result<(), RegistryError> {
        match half {
            ServiceHalf::Request => self.set_publish_size(info.buffer_size),
            ServiceHalf::Response => self.set_subscribe_size(info.buffer_size),
        }
        let state = self.service_client_state(info)?;
        match half {
            ServiceHalf::Request => {
                check_md5(state.class.request.as_ref(), info)?;
                self.handlers.insert(info.topic_id, Handler::ServiceRequest(state));
            }
            ServiceHalf::Response => {
                check_md5(state.class.response.as_ref(), info)?;
                state.response_id.store(info.topic_id, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Dispatches an inbound payload. Returns false when the id is unbound so
    /// the session can re-request topics.
    pub fn handle(&self, topic_id: u16, payload: &[u8]) -> bool {
        let Some(handler) = self.handlers.get(&topic_id) else {
            return false;
        };
        match handler {
            Handler::Publish => {
                if let Some(publisher) = self.publishers.get(&topic_id) {
                    let outcome = publisher
                        .class
                        .deserialize(payload)
                        .and_then(|msg| publisher.publication.publish(msg));
                    if let Err(err) = outcome {
                        error!(topic = %publisher.topic_name, %err, "publisher handling packet failed");
                    }
                }
            }
            Handler::ServiceResponse(state) => state.complete(payload),
            Handler::ServiceRequest(state) => state.handle_request(payload),
        }
        true
    }

    /// Releases every middleware handle. Safe to call more than once.
    pub fn teardown(&mut self) {
        for (topic, mut sub) in self.subscribers.drain() {
            info!(%topic, topic_id = sub.topic_id, "removing subscriber");
            sub.handle.unregister();
        }
        for (topic, endpoint) in self.services.drain() {
            if let ServiceEndpoint::Server { mut registration, .. } = endpoint {
                info!(%topic, "removing service");
                registration.shutdown();
            }
        }
        self.publishers.clear();
        self.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::Receiver;

    use super::*;
    use crate::testing::{MemoryHost, StaticTypes};

    const STRING_MD5: &str = "992ce8a1687cec8c8bd883ec73ca41d1";
    const TWIST_MD5: &str = "9f195f881246fdfa2798d1d3eebca84a";
    const REQ_MD5: &str = "aaaa0000aaaa0000aaaa0000aaaa0000";
    const RESP_MD5: &str = "bbbb1111bbbb1111bbbb1111bbbb1111";

    fn registry(host: &MemoryHost) -> (Registry, Receiver<WriteItem>) {
        let (write_tx, write_rx) = crossbeam_channel::unbounded();
        let registry = Registry::new(
            host.context(),
            write_tx,
            Duration::from_millis(200),
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
        );
        (registry, write_rx)
    }

    fn announce(topic_id: u16, topic_name: &str, message_type: &str, md5sum: &str) -> TopicInfo {
        TopicInfo {
            topic_id,
            topic_name: topic_name.to_string(),
            message_type: message_type.to_string(),
            md5sum: md5sum.to_string(),
            buffer_size: 280,
        }
    }

    #[test]
    fn publisher_install_binds_handler_and_forwards() {
        let host = MemoryHost::new(StaticTypes::new().with_message("std_msgs/String", STRING_MD5));
        let (mut registry, _rx) = registry(&host);

        registry
            .install_publisher(&announce(125, "chatter", "std_msgs/String", STRING_MD5))
            .unwrap();
        assert!(registry.handle(125, &[1, 2, 3]));
        assert_eq!(host.middleware.published(), [("chatter".to_string(), vec![1, 2, 3])]);
    }

    #[test]
    fn md5_mismatch_leaves_id_unbound() {
        let host = MemoryHost::new(StaticTypes::new().with_message("std_msgs/String", STRING_MD5));
        let (mut registry, _rx) = registry(&host);

        let err = registry
            .install_publisher(&announce(125, "chatter", "std_msgs/String", TWIST_MD5))
            .unwrap_err();
        assert!(matches!(err, RegistryError::ChecksumMismatch { .. }));
        assert!(!registry.handle(125, &[0]));
    }

    #[test]
    fn unresolvable_type_is_scoped_to_the_endpoint() {
        let host = MemoryHost::new(StaticTypes::new());
        let (mut registry, _rx) = registry(&host);

        let err =
            registry.install_publisher(&announce(125, "chatter", "foo/Missing", STRING_MD5)).unwrap_err();
        assert!(matches!(err, RegistryError::Middleware(MiddlewareError::UnknownType { .. })));
    }

    #[test]
    fn topic_id_reuse_with_other_checksum_is_rejected() {
        let host = MemoryHost::new(
            StaticTypes::new()
                .with_message("std_msgs/String", STRING_MD5)
                .with_message("geometry_msgs/Twist", TWIST_MD5),
        );
        let (mut registry, _rx) = registry(&host);

        registry
            .install_publisher(&announce(125, "chatter", "std_msgs/String", STRING_MD5))
            .unwrap();
        let err = registry
            .install_publisher(&announce(125, "cmd_vel", "geometry_msgs/Twist", TWIST_MD5))
            .unwrap_err();
        assert!(matches!(err, RegistryError::TopicIdReuse { id: 125, .. }));
    }

    #[test]
    fn subscriber_reannounce_is_idempotent_and_rebind_swaps_types() {
        let host = MemoryHost::new(
            StaticTypes::new()
                .with_message("std_msgs/String", STRING_MD5)
                .with_message("geometry_msgs/Twist", TWIST_MD5),
        );
        let (mut registry, write_rx) = registry(&host);

        registry.install_subscriber(&announce(126, "cmd", "std_msgs/String", STRING_MD5)).unwrap();
        registry.install_subscriber(&announce(126, "cmd", "std_msgs/String", STRING_MD5)).unwrap();
        assert!(host.middleware.is_subscribed("cmd"));

        // New type under the same name: the old subscription goes away first.
        registry.install_subscriber(&announce(130, "cmd", "geometry_msgs/Twist", TWIST_MD5)).unwrap();
        assert!(host.middleware.is_subscribed("cmd"));

        assert!(host.middleware.deliver("cmd", &[9]));
        match write_rx.try_recv().unwrap() {
            WriteItem::Message { topic_id, payload } => {
                assert_eq!(topic_id, 130);
                assert_eq!(payload, [9]);
            }
            _ => panic!("expected a framed message"),
        }
    }

    #[test]
    fn service_halves_check_their_own_md5() {
        let host = MemoryHost::new(StaticTypes::new().with_service("beacon/SetMode", REQ_MD5, RESP_MD5));
        let (mut registry, _rx) = registry(&host);

        registry
            .install_service_server(
                &announce(128, "set_mode", "beacon/SetMode", RESP_MD5),
                ServiceHalf::Response,
            )
            .unwrap();
        let err = registry
            .install_service_server(
                &announce(129, "set_mode", "beacon/SetMode", RESP_MD5),
                ServiceHalf::Request,
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::ChecksumMismatch { .. }));
        registry
            .install_service_server(
                &announce(129, "set_mode", "beacon/SetMode", REQ_MD5),
                ServiceHalf::Request,
            )
            .unwrap();
    }

    #[test]
    fn teardown_releases_handles_and_is_idempotent() {
        let host = MemoryHost::new(
            StaticTypes::new()
                .with_message("std_msgs/String", STRING_MD5)
                .with_service("beacon/SetMode", REQ_MD5, RESP_MD5),
        );
        let (mut registry, _rx) = registry(&host);

        registry.install_subscriber(&announce(126, "cmd", "std_msgs/String", STRING_MD5)).unwrap();
        registry
            .install_service_server(
                &announce(128, "set_mode", "beacon/SetMode", RESP_MD5),
                ServiceHalf::Response,
            )
            .unwrap();
        assert!(host.middleware.is_subscribed("cmd"));
        assert!(host.middleware.has_service("set_mode"));

        registry.teardown();
        assert!(!host.middleware.is_subscribed("cmd"));
        assert!(!host.middleware.has_service("set_mode"));
        registry.teardown();
    }
}
