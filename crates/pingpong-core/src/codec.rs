//! JSON codec for call arguments, results and envelopes.

use crate::error::{ChannelError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Encode a value to JSON bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode JSON bytes, failing with `Encoding` on malformed input.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| ChannelError::Encoding {
        message: format!("Failed to decode payload: {}", e),
        source: Some(e),
    })
}

/// Convert a typed value into call arguments.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Convert call arguments or a call result into a typed value.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ChannelError::Encoding {
        message: format!("Unexpected payload shape: {}", e),
        source: Some(e),
    })
}
