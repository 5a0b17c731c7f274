//! Centralized configuration for the channel and the ping driver.

use std::time::Duration;

/// Wire transport limits and timeouts.
pub struct TransportConfig;

impl TransportConfig {
    /// Largest frame payload accepted from a connection.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
    /// Inbound connections served at once; extra connections are dropped.
    pub const MAX_CONNECTIONS: usize = 256;
    /// Responses queued per connection before inbound calls wait for the writer.
    pub const RESPONSE_QUEUE_DEPTH: usize = 64;
}

/// Defaults for the self-ping service.
pub struct PingConfig;

impl PingConfig {
    pub const SERVICE_NAME: &'static str = "PingService";
    pub const CLIENT_NAME: &'static str = "ping-client";
    pub const METHOD: &'static str = "ping";
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 10500;
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const INTERVAL: Duration = Duration::from_secs(10);
    /// Timestamp format for ping messages, e.g. `Mon Jan  2 15:04:05 UTC 2006`.
    pub const TIMESTAMP_FORMAT: &'static str = "%a %b %e %H:%M:%S %Z %Y";
}

/// Runtime settings for a [`crate::PingLoop`].
#[derive(Debug, Clone)]
pub struct PingLoopConfig {
    pub service: String,
    pub method: String,
    pub call_timeout: Duration,
    pub interval: Duration,
}

impl Default for PingLoopConfig {
    fn default() -> Self {
        Self {
            service: PingConfig::SERVICE_NAME.to_string(),
            method: PingConfig::METHOD.to_string(),
            call_timeout: PingConfig::CALL_TIMEOUT,
            interval: PingConfig::INTERVAL,
        }
    }
}
