//! Handler registration and inbound dispatch.

use crate::codec;
use crate::error::{ChannelError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub service: String,
    pub method: String,
    pub remote_addr: SocketAddr,
    /// Time the caller was still willing to wait when the request arrived.
    pub ttl: Option<Duration>,
}

/// Logic that computes a response for an inbound request.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, call: &CallInfo, params: Value) -> Result<Value>;
}

/// Observer for errors returned by handlers, invoked once per failed call.
pub type ErrorObserver = Arc<dyn Fn(&CallInfo, &ChannelError) + Send + Sync>;

/// Adapts a typed async function into a [`Handler`].
///
/// Arguments are decoded into `Req` and the returned `Resp` is encoded back to
/// JSON; a decoding failure is reported as an `Encoding` error.
pub struct FnHandler<F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<F, Fut, Req, Resp> FnHandler<F, Req, Resp>
where
    F: Fn(CallInfo, Req) -> Fut,
    Fut: Future<Output = Result<Resp>>,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut, Req, Resp> Handler for FnHandler<F, Req, Resp>
where
    F: Fn(CallInfo, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn handle(&self, call: &CallInfo, params: Value) -> Result<Value> {
        let request: Req = codec::from_value(params)?;
        let response = (self.f)(call.clone(), request).await?;
        codec::to_value(&response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    service: String,
    method: String,
}

/// Maps `(service, method)` to handlers.
///
/// Registration may happen at any time; a dispatch sees every handler registered
/// before it started.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<MethodKey, Arc<dyn Handler>>>,
    on_error: RwLock<Option<ErrorObserver>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler`, replacing any previous handler for the same method.
    pub fn register(&self, service: &str, method: &str, handler: Arc<dyn Handler>) {
        let key = MethodKey {
            service: service.to_string(),
            method: method.to_string(),
        };
        let mut handlers = self.handlers.write().expect("handler registry lock poisoned");
        if handlers.insert(key, handler).is_some() {
            debug!("Replaced handler for {}::{}", service, method);
        } else {
            debug!("Registered handler for {}::{}", service, method);
        }
    }

    /// Install the observer handed every handler error.
    pub fn set_error_observer(&self, observer: ErrorObserver) {
        *self.on_error.write().expect("handler registry lock poisoned") = Some(observer);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().expect("handler registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, service: &str, method: &str) -> Option<Arc<dyn Handler>> {
        let key = MethodKey {
            service: service.to_string(),
            method: method.to_string(),
        };
        let handlers = self.handlers.read().expect("handler registry lock poisoned");
        handlers.get(&key).cloned()
    }

    /// Route a call to its handler.
    ///
    /// Fails with `MethodNotFound` when nothing is registered. A handler's own
    /// error is passed to the error observer, then returned unchanged.
    pub async fn dispatch(&self, call: &CallInfo, params: Value) -> Result<Value> {
        let handler = self
            .lookup(&call.service, &call.method)
            .ok_or_else(|| ChannelError::MethodNotFound {
                service: call.service.clone(),
                method: call.method.clone(),
            })?;

        let result = handler.handle(call, params).await;
        if let Err(err) = &result {
            self.report(call, err);
        }
        result
    }

    fn report(&self, call: &CallInfo, err: &ChannelError) {
        let observer = self
            .on_error
            .read()
            .expect("handler registry lock poisoned")
            .clone();
        if let Some(observer) = observer {
            observer(call, err);
        }
    }
}
