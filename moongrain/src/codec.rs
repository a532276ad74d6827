//! JSON body codec.
//!
//! Grain method requests and responses, transactional state snapshots and
//! reminder payloads are carried as bytes (or JSON values) and only turned
//! back into typed values here.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::GrainError;

/// Encode a value as a JSON body.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, GrainError> {
    serde_json::to_vec(value).map_err(|e| GrainError::Codec(format!("encode: {e}")))
}

/// Decode a JSON body.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, GrainError> {
    serde_json::from_slice(body).map_err(|e| GrainError::Codec(format!("decode: {e}")))
}

/// Convert a value to a JSON document (used by state storage).
pub fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, GrainError> {
    serde_json::to_value(value).map_err(|e| GrainError::Codec(format!("encode: {e}")))
}

/// Convert a JSON document back to a typed value.
pub fn from_value<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, GrainError> {
    serde_json::from_value(value).map_err(|e| GrainError::Codec(format!("decode: {e}")))
}
