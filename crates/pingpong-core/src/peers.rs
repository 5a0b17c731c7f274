//! Known remote endpoints and their connections.
//!
//! # Thread Safety
//!
//! [`PeerSet`] is shared between the outbound driver and the inbound listener, so
//! its map sits behind an `RwLock`. Each [`Peer`] serializes access to its single
//! cached connection with a tokio `Mutex`; at most one exchange is in flight per
//! peer.

use crate::codec;
use crate::error::{ChannelError, Result};
use crate::protocol::{read_frame, write_frame, CallRequest, CallResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// A remote endpoint reachable for calls.
#[derive(Debug)]
pub struct Peer {
    host_port: String,
    connection: Mutex<Option<TcpStream>>,
    next_id: AtomicU64,
}

impl Peer {
    fn new(host_port: String) -> Self {
        Self {
            host_port,
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// The `host:port` this peer was added under.
    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    /// Whether a connection is currently cached or in use.
    pub fn is_connected(&self) -> bool {
        match self.connection.try_lock() {
            Ok(slot) => slot.is_some(),
            Err(_) => true,
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one request and wait for its response on the cached connection.
    ///
    /// The connection is only returned to the slot after a clean exchange. If the
    /// exchange fails, or the future is dropped mid-flight by a deadline, the
    /// connection is dropped with it and the next call reconnects.
    pub(crate) async fn exchange(&self, request: &CallRequest) -> Result<CallResponse> {
        let request_bytes = codec::encode(request)?;

        let mut slot = self.connection.lock().await;
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        write_frame(&mut stream, &request_bytes)
            .await
            .map_err(|e| ChannelError::connection(&self.host_port, e))?;

        let response_bytes = read_frame(&mut stream)
            .await
            .map_err(|e| ChannelError::connection(&self.host_port, e))?
            .ok_or_else(|| ChannelError::connection(&self.host_port, "connection closed by peer"))?;

        let response: CallResponse = codec::decode(&response_bytes)?;
        if response.id != request.id {
            return Err(ChannelError::connection(
                &self.host_port,
                format!(
                    "response id {:?} does not match request id {:?}",
                    response.id, request.id
                ),
            ));
        }

        *slot = Some(stream);
        Ok(response)
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(self.host_port.as_str())
            .await
            .map_err(|e| ChannelError::connection(&self.host_port, e))?;
        configure_stream(&stream, &self.host_port);
        debug!("Connected to peer {}", self.host_port);
        Ok(stream)
    }
}

/// Disable Nagle on an outbound connection; requests are single small frames.
fn configure_stream(stream: &TcpStream, host_port: &str) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", host_port, e);
    }
}

/// Set of peers keyed by address. Peers are never evicted.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the peer for `host_port`, creating it on first use.
    ///
    /// Repeated calls with the same address return the same `Arc`.
    pub fn add(&self, host_port: &str) -> Arc<Peer> {
        if let Some(peer) = self.get(host_port) {
            return peer;
        }

        let mut peers = self.peers.write().expect("peer set lock poisoned");
        peers
            .entry(host_port.to_string())
            .or_insert_with(|| {
                debug!("Adding peer {}", host_port);
                Arc::new(Peer::new(host_port.to_string()))
            })
            .clone()
    }

    pub fn get(&self, host_port: &str) -> Option<Arc<Peer>> {
        let peers = self.peers.read().expect("peer set lock poisoned");
        peers.get(host_port).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("peer set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses of all known peers, in no particular order.
    pub fn addresses(&self) -> Vec<String> {
        let peers = self.peers.read().expect("peer set lock poisoned");
        peers.keys().cloned().collect()
    }
}
