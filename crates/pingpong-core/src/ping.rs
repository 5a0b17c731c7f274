//! Self-ping service: the echo handler and the periodic driver that calls it.

use crate::cancel::CancellationToken;
use crate::channel::Channel;
use crate::config::{PingConfig, PingLoopConfig};
use crate::context::CallContext;
use crate::error::{ChannelError, Result};
use crate::handler::CallInfo;
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, Instrument, Span};

/// Ping request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub message: String,
}

impl Ping {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// A ping carrying the current time, e.g. `Mon Jan  2 15:04:05 UTC 2006`.
    pub fn now() -> Self {
        Self::new(
            chrono::Utc::now()
                .format(PingConfig::TIMESTAMP_FORMAT)
                .to_string(),
        )
    }
}

/// Ping response; same shape as [`Ping`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub message: String,
}

impl From<Ping> for Pong {
    fn from(ping: Ping) -> Self {
        Self {
            message: ping.message,
        }
    }
}

/// Echo handler: answers every ping with a pong carrying the same message.
pub async fn ping_handler(_call: CallInfo, ping: Ping) -> Result<Pong> {
    info!("recv ping: '{}', sending pong", ping.message);
    Ok(Pong::from(ping))
}

/// Register [`ping_handler`] as `service::ping` on `channel`.
pub fn register_ping_handler(channel: &Channel, service: &str) {
    channel.register_fn(service, PingConfig::METHOD, ping_handler);
}

/// Periodically pings its own channel through the channel's peer set.
///
/// Every call failure is logged and the loop moves on to the next tick; only
/// cancelling the shutdown token stops it.
pub struct PingLoop {
    channel: Channel,
    config: PingLoopConfig,
    shutdown: CancellationToken,
    span: Span,
}

impl PingLoop {
    pub fn new(channel: Channel, config: PingLoopConfig) -> Self {
        let span = info_span!("ping_loop", channel = %channel.name());
        Self {
            channel,
            config,
            shutdown: CancellationToken::new(),
            span,
        }
    }

    /// Stop the loop when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Log under `span` instead of the default `ping_loop` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// One iteration: ping our own bound address and return the pong.
    ///
    /// The call's context lives only for this iteration and is cancelled when
    /// it returns, whatever the outcome.
    pub async fn ping_once(&self) -> Result<Pong> {
        let ctx = CallContext::with_timeout(self.config.call_timeout);

        let host_port = self
            .channel
            .host_port()
            .ok_or_else(|| ChannelError::Other("channel is not listening".to_string()))?;
        let peer = self.channel.peers().add(&host_port);

        let ping = Ping::now();
        info!("send ping: '{}'", ping.message);

        let pong: Pong = self
            .channel
            .call(&ctx, &peer, &self.config.service, &self.config.method, &ping)
            .await?;

        info!("recv pong: '{}'", pong.message);
        Ok(pong)
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(self) {
        let span = self.span.clone();
        async move {
            info!(
                "Pinging {}::{} every {:?}",
                self.config.service, self.config.method, self.config.interval
            );
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    result = self.ping_once() => {
                        if let Err(e) = result {
                            error!(error = %e, "Ping call failed");
                        }
                    }
                }

                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
            info!("Ping loop stopped");
        }
        .instrument(span)
        .await
    }

    /// Run the loop on a background task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
