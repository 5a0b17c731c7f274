//! Error types for the RPC channel.
//!
//! Every failure a caller, a handler, or the listener can observe is a variant of
//! [`ChannelError`]. Errors that cross the wire are reduced to a JSON-RPC code and
//! message by [`ChannelError::to_rpc_error_code`] and rebuilt on the calling side by
//! [`ChannelError::from_rpc_error`].

use std::time::Duration;
use thiserror::Error;

/// JSON-RPC 2.0 error codes used on the wire.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Application-defined: the server gave up on the request's deadline.
    pub const TIMEOUT: i32 = -32000;
}

/// Main error type for channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    // Startup errors
    #[error("Couldn't listen on {addr}: {message}")]
    Bind {
        addr: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Dispatch errors
    #[error("Method not found: {service}::{method}")]
    MethodNotFound { service: String, method: String },

    #[error("Handler error: {0}")]
    Handler(String),

    // Call errors
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Connection error with {peer}: {message}")]
    Connection { peer: String, message: String },

    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    // Serialization errors
    #[error("Encoding error: {message}")]
    Encoding {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Encoding {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ChannelError {
    /// Create a handler error from any displayable message.
    pub fn handler(message: impl Into<String>) -> Self {
        ChannelError::Handler(message.into())
    }

    /// Create a connection error for the given peer address.
    pub fn connection(peer: impl Into<String>, message: impl ToString) -> Self {
        ChannelError::Connection {
            peer: peer.into(),
            message: message.to_string(),
        }
    }

    /// Convert to a JSON-RPC error code for the response envelope.
    ///
    /// - -32601: Method not found
    /// - -32602: Arguments could not be decoded
    /// - -32000: Deadline exceeded while serving
    /// - -32603: Everything else, including handler failures
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            ChannelError::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            ChannelError::Encoding { .. } => codes::INVALID_PARAMS,
            ChannelError::Timeout(_) => codes::TIMEOUT,
            ChannelError::Remote { code, .. } => *code,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Rebuild a caller-side error from a response's error object.
    ///
    /// Payload decoding failures on the server surface as `Encoding` so the caller
    /// can tell a malformed exchange from a failing handler. A server that ran out
    /// the request's ttl reports `Timeout`; the caller fills in its own duration.
    /// Everything else, method-not-found included, is a `Remote` error.
    pub fn from_rpc_error(code: i32, message: String) -> Self {
        match code {
            codes::TIMEOUT => ChannelError::Timeout(Duration::ZERO),
            codes::PARSE_ERROR | codes::INVALID_PARAMS => ChannelError::Encoding {
                message,
                source: None,
            },
            _ => ChannelError::Remote { code, message },
        }
    }

    /// Whether this is a remote error reporting an unregistered method.
    pub fn is_method_not_found(&self) -> bool {
        matches!(
            self,
            ChannelError::Remote {
                code: codes::METHOD_NOT_FOUND,
                ..
            }
        )
    }
}
