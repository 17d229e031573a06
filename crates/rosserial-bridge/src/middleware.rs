//! The narrow trait surface through which the bridge reaches its host-side
//! collaborators: message-type reflection, the publish/subscribe and service
//! layer, and the parameter store. The bridge owns none of these; a binding
//! crate implements them against the actual middleware, and
//! [`crate::testing`] carries in-memory doubles.

use std::{any::Any, sync::Arc};

use thiserror::Error;

/// An opaque deserialized message value. Only the [`MessageClass`] that
/// produced it knows its concrete type; the bridge moves it around blindly.
pub type DynMessage = Box<dyn Any + Send>;

#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("unknown message type {package}/{name}")]
    UnknownType { package: String, name: String },
    #[error("message codec error: {0}")]
    Codec(String),
    #[error("middleware rejected the operation: {0}")]
    Rejected(String),
    #[error("service call timed out")]
    ServiceTimeout,
}

/// Codec handle for one message type, resolved by name at negotiation time.
pub trait MessageClass: Send + Sync {
    /// Full type name, formatted `"package/Type"`.
    fn type_name(&self) -> &str;
    /// The 32-hex-char fingerprint of the message definition. Compared as a
    /// plain string against what the device announces.
    fn md5sum(&self) -> &str;
    fn deserialize(&self, bytes: &[u8]) -> Result<DynMessage, MiddlewareError>;
    fn serialize(&self, msg: &DynMessage) -> Result<Vec<u8>, MiddlewareError>;
}

/// Request and response codecs of one service type.
#[derive(Clone)]
pub struct ServiceClass {
    pub type_name: String,
    pub request: Arc<dyn MessageClass>,
    pub response: Arc<dyn MessageClass>,
}

/// Pre-populated `(package, name) → codec` lookup. Replaces the runtime
/// module reflection of dynamic-language hosts.
pub trait TypeRegistry: Send + Sync {
    fn resolve_message(
        &self,
        package: &str,
        name: &str,
    ) -> Result<Arc<dyn MessageClass>, MiddlewareError>;
    fn resolve_service(&self, package: &str, name: &str) -> Result<ServiceClass, MiddlewareError>;
}

pub type SubscriberFn = Box<dyn Fn(DynMessage) + Send + Sync>;
pub type ServiceFn = Box<dyn Fn(DynMessage) -> Result<DynMessage, MiddlewareError> + Send + Sync>;

pub trait Publication: Send + Sync {
    fn publish(&self, msg: DynMessage) -> Result<(), MiddlewareError>;
}

pub trait Subscription: Send {
    fn unregister(&mut self);
}

pub trait ServiceRegistration: Send {
    fn shutdown(&mut self);
}

pub trait ServiceProxy: Send + Sync {
    fn call(&self, request: DynMessage) -> Result<DynMessage, MiddlewareError>;
}

/// The host middleware's publish/subscribe and service API.
///
/// Callbacks are invoked from middleware worker threads, concurrently with
/// the session's reader and writer. A service-server callback may block its
/// worker until the device answers.
pub trait Middleware: Send + Sync {
    fn publisher(
        &self,
        topic: &str,
        class: &Arc<dyn MessageClass>,
    ) -> Result<Box<dyn Publication>, MiddlewareError>;

    fn subscriber(
        &self,
        topic: &str,
        class: &Arc<dyn MessageClass>,
        callback: SubscriberFn,
    ) -> Result<Box<dyn Subscription>, MiddlewareError>;

    fn service_server(
        &self,
        topic: &str,
        class: &ServiceClass,
        callback: ServiceFn,
    ) -> Result<Box<dyn ServiceRegistration>, MiddlewareError>;

    /// Blocks until the named service is available, then returns a proxy.
    fn service_proxy(
        &self,
        topic: &str,
        class: &ServiceClass,
    ) -> Result<Box<dyn ServiceProxy>, MiddlewareError>;
}

/// A parameter-store value. Only scalars and homogeneous lists of scalars can
/// be answered to the device; `Map` exists so the store can report a
/// dictionary parameter, which the bridge rejects.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
    Map,
}

pub trait ParameterStore: Send + Sync {
    fn get(&self, name: &str) -> Option<ParamValue>;
}

/// Everything a session needs from the host side, cheap to clone per
/// accepted connection.
#[derive(Clone)]
pub struct BridgeContext {
    pub middleware: Arc<dyn Middleware>,
    pub types: Arc<dyn TypeRegistry>,
    pub params: Arc<dyn ParameterStore>,
    pub diagnostics: Arc<dyn crate::diagnostics::DiagnosticsSink>,
}
