//! Pingpong Core - a bidirectional JSON RPC channel.
//!
//! A [`Channel`] serves inbound calls to registered handlers and issues outbound
//! calls to peers over the same length-prefixed JSON-RPC transport. Every
//! outbound call is bounded by a [`CallContext`] deadline and is cancelled when
//! the context goes out of scope. [`PingLoop`] drives the channel by
//! periodically calling its own `ping` handler.
//!
//! # Example
//!
//! ```rust,ignore
//! use pingpong_core::{register_ping_handler, Channel, PingLoop, PingLoopConfig};
//!
//! #[tokio::main]
//! async fn main() -> pingpong_core::Result<()> {
//!     let channel = Channel::new("PingService");
//!     register_ping_handler(&channel, "PingService");
//!     let _server = channel.open("127.0.0.1:10500").await?;
//!
//!     PingLoop::new(channel, PingLoopConfig::default()).run().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod peers;
pub mod ping;
pub mod protocol;

pub use cancel::{CancellationToken, CancelledError};
pub use channel::{Channel, ServeHandle};
pub use config::{PingConfig, PingLoopConfig, TransportConfig};
pub use context::{CallContext, CallState};
pub use error::{ChannelError, Result};
pub use handler::{CallInfo, ErrorObserver, FnHandler, Handler, HandlerRegistry};
pub use peers::{Peer, PeerSet};
pub use ping::{ping_handler, register_ping_handler, Ping, PingLoop, Pong};
pub use protocol::{CallRequest, CallResponse};
