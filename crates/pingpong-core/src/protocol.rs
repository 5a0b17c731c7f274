//! Wire envelopes and framing shared by the listener and outbound calls.
//!
//! Each frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON-RPC 2.0
//! payload. Requests additionally carry the target service name and the caller's
//! remaining time to live.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::TransportConfig;
use crate::error::{ChannelError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound call envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub jsonrpc: String,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub id: Option<u64>,
    /// Milliseconds the caller is still willing to wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl CallRequest {
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
        id: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            service: service.into(),
            method: method.into(),
            params: Some(params),
            id: Some(id),
            ttl_ms: Some(ttl_to_millis(ttl)),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// Whole milliseconds covering `ttl`, rounded up so the server never gives up
/// before the caller's own deadline.
fn ttl_to_millis(ttl: Duration) -> u64 {
    ttl.as_micros().div_ceil(1000).min(u64::MAX as u128) as u64
}

/// Response envelope: exactly one of `result` or `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: Option<u64>,
}

impl CallResponse {
    pub fn success(id: Option<u64>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<u64>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(ErrorObject {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Build the error response for a failed dispatch.
    pub fn from_error(id: Option<u64>, err: &ChannelError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.to_string())
    }

    /// Unwrap into the call's result, turning an error object into a caller-side error.
    pub fn into_result(self) -> Result<serde_json::Value> {
        if let Some(err) = self.error {
            return Err(ChannelError::from_rpc_error(err.code, err.message));
        }
        self.result.ok_or_else(|| ChannelError::Encoding {
            message: "Response missing result".to_string(),
            source: None,
        })
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > TransportConfig::MAX_MESSAGE_SIZE {
        return Err(ChannelError::Validation {
            field: "frame".to_string(),
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                TransportConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| ChannelError::Validation {
        field: "frame".to_string(),
        message: format!("payload of {} bytes cannot be framed", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
