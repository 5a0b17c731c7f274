//! Bidirectional RPC endpoint.
//!
//! A [`Channel`] is one addressable endpoint that serves inbound calls to its
//! registered handlers and issues outbound calls to peers. `open` binds a TCP
//! listener and serves it from background tokio tasks; outbound calls use the
//! channel's [`PeerSet`] and are bounded by a [`CallContext`].
//!
//! # Thread Safety
//!
//! `Channel` is a cheap `Arc` clone. Each inbound connection runs in its own task
//! and every request on it is dispatched in a task of its own, so handlers for
//! distinct calls run concurrently. Shutting the listener down aborts the
//! connection's outstanding request tasks. Responses on one connection are written by a
//! single writer task in completion order.

use crate::codec;
use crate::config::TransportConfig;
use crate::context::{CallContext, CallState};
use crate::error::{codes, ChannelError, Result};
use crate::handler::{CallInfo, ErrorObserver, FnHandler, Handler, HandlerRegistry};
use crate::peers::{Peer, PeerSet};
use crate::protocol::{read_frame, write_frame, CallRequest, CallResponse, JSONRPC_VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Handle to a channel's background listener. Dropping shuts it down.
pub struct ServeHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServeHandle {
    /// Get the address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close the active ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Shut down and wait for the accept loop to exit.
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ServeHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

struct ChannelInner {
    name: String,
    registry: HandlerRegistry,
    peers: PeerSet,
    bound_addr: OnceLock<SocketAddr>,
    span: Span,
}

/// An RPC endpoint that both serves and issues calls.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("bound_addr", &self.inner.bound_addr.get())
            .finish()
    }
}

impl Channel {
    /// Create an unopened channel that logs under a `channel` span named after it.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let span = info_span!("channel", name = %name);
        Self::with_span(name, span)
    }

    /// Create an unopened channel that logs under the given span.
    pub fn with_span(name: impl Into<String>, span: Span) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                registry: HandlerRegistry::new(),
                peers: PeerSet::new(),
                bound_addr: OnceLock::new(),
                span,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn peers(&self) -> &PeerSet {
        &self.inner.peers
    }

    /// Address from a successful `open`.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.inner.bound_addr.get().copied()
    }

    /// `host:port` other channels use to reach this one.
    pub fn host_port(&self) -> Option<String> {
        self.bound_addr().map(|addr| addr.to_string())
    }

    /// Install a handler for `service::method`.
    pub fn register<H: Handler>(&self, service: &str, method: &str, handler: H) {
        self.inner
            .registry
            .register(service, method, Arc::new(handler));
    }

    /// Install a typed async function as the handler for `service::method`.
    pub fn register_fn<F, Fut, Req, Resp>(&self, service: &str, method: &str, f: F)
    where
        F: Fn(CallInfo, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.register(service, method, FnHandler::new(f));
    }

    /// Install the observer that receives every error a handler returns.
    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&CallInfo, &ChannelError) + Send + Sync + 'static,
    {
        let observer: ErrorObserver = Arc::new(observer);
        self.inner.registry.set_error_observer(observer);
    }

    /// Bind `addr` and start serving in the background.
    ///
    /// A channel can be opened once. Bind failures are returned as `Bind`.
    pub async fn open(&self, addr: &str) -> Result<ServeHandle> {
        if self.inner.bound_addr.get().is_some() {
            return Err(ChannelError::Other(format!(
                "channel {} is already open",
                self.inner.name
            )));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ChannelError::Bind {
                addr: addr.to_string(),
                message: e.to_string(),
                source: Some(e),
            })?;
        let local_addr = listener.local_addr()?;
        if self.inner.bound_addr.set(local_addr).is_err() {
            return Err(ChannelError::Other(format!(
                "channel {} is already open",
                self.inner.name
            )));
        }

        self.inner.span.in_scope(|| info!("Service {}", local_addr));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(
            Self::accept_loop(
                self.inner.clone(),
                listener,
                shutdown_rx,
                conn_shutdown_rx,
                Arc::new(AtomicUsize::new(0)),
            )
            .instrument(self.inner.span.clone()),
        );

        Ok(ServeHandle {
            addr: local_addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    /// Issue one call to `peer` and decode its response.
    ///
    /// An expired or cancelled context fails before any I/O. Otherwise the
    /// exchange is raced against the context: `Timeout` if the deadline passes
    /// first (on either side of the connection), `Cancelled` if the context is
    /// cancelled, `Connection` on transport failure, `Remote` or `Encoding` for
    /// other failures reported by the peer.
    pub async fn call<Req, Resp>(
        &self,
        ctx: &CallContext,
        peer: &Peer,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        ctx.check()?;

        let params = codec::to_value(request)?;
        let call_request = CallRequest::new(service, method, params, peer.next_id(), ctx.remaining());

        async {
            debug!(
                peer = peer.host_port(),
                id = ?call_request.id,
                state = ?CallState::Sent,
                "Calling {}::{}",
                service,
                method
            );

            let result = ctx
                .run(peer.exchange(&call_request))
                .await
                .and_then(CallResponse::into_result)
                .and_then(codec::from_value)
                .map_err(|e| match e {
                    ChannelError::Timeout(_) => ChannelError::Timeout(ctx.timeout()),
                    e => e,
                });

            debug!(
                peer = peer.host_port(),
                id = ?call_request.id,
                state = ?CallState::from_outcome(&result),
                "Call to {}::{} finished",
                service,
                method
            );
            result
        }
        .instrument(self.inner.span.clone())
        .await
    }

    async fn accept_loop(
        inner: Arc<ChannelInner>,
        listener: TcpListener,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, remote_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= TransportConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    remote_addr,
                                    TransportConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let inner = inner.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();
                            let span = inner.span.clone();

                            tokio::spawn(
                                async move {
                                    debug!("Connection from {}", remote_addr);
                                    if let Err(e) = Self::handle_connection(inner, stream, remote_addr, conn_shutdown).await {
                                        debug!("Connection {} ended: {}", remote_addr, e);
                                    }
                                    conns.fetch_sub(1, Ordering::Relaxed);
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        inner: Arc<ChannelInner>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (response_tx, mut response_rx) =
            mpsc::channel::<Vec<u8>>(TransportConfig::RESPONSE_QUEUE_DEPTH);

        let writer_task = tokio::spawn(
            async move {
                while let Some(bytes) = response_rx.recv().await {
                    if let Err(e) = write_frame(&mut writer, &bytes).await {
                        debug!("Write to {} failed: {}", remote_addr, e);
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        let mut requests = JoinSet::new();
        let result = loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    requests.abort_all();
                    writer_task.abort();
                    return Ok(());
                }
            };

            let inner = inner.clone();
            let response_tx = response_tx.clone();
            requests.spawn(
                async move {
                    let response = Self::process_request(&inner.registry, &frame, remote_addr).await;
                    match codec::encode(&response) {
                        Ok(bytes) => {
                            let _ = response_tx.send(bytes).await;
                        }
                        Err(e) => error!("Failed to encode response: {}", e),
                    }
                }
                .in_current_span(),
            );
            while requests.try_join_next().is_some() {}
        };

        // In-flight requests keep their own senders; the writer drains them and
        // exits. A shutdown meanwhile drops `requests`, which aborts the rest.
        drop(response_tx);
        tokio::select! {
            _ = async { while requests.join_next().await.is_some() {} } => {}
            _ = shutdown_rx.changed() => writer_task.abort(),
        }
        result
    }

    async fn process_request(
        registry: &HandlerRegistry,
        frame: &[u8],
        remote_addr: SocketAddr,
    ) -> CallResponse {
        let request: CallRequest = match codec::decode(frame) {
            Ok(req) => req,
            Err(e) => {
                return CallResponse::error(None, codes::PARSE_ERROR, format!("Parse error: {}", e));
            }
        };

        if request.jsonrpc != JSONRPC_VERSION {
            return CallResponse::error(
                request.id,
                codes::INVALID_REQUEST,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            );
        }

        let call = CallInfo {
            service: request.service,
            method: request.method,
            remote_addr,
            ttl: request.ttl_ms.map(std::time::Duration::from_millis),
        };
        let params = request
            .params
            .unwrap_or(serde_json::Value::Object(Default::default()));

        let dispatch = registry.dispatch(&call, params);
        let result = match call.ttl {
            Some(ttl) => match tokio::time::timeout(ttl, dispatch).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Timeout(ttl)),
            },
            None => dispatch.await,
        };

        match result {
            Ok(value) => CallResponse::success(request.id, value),
            Err(e) => {
                match &e {
                    ChannelError::MethodNotFound { .. } => warn!("{} (from {})", e, remote_addr),
                    _ => debug!("{}::{} failed: {}", call.service, call.method, e),
                }
                CallResponse::from_error(request.id, &e)
            }
        }
    }
}
