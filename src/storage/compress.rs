//! Payload encoding for execution records.
//!
//! Payloads are serialized as JSON; anything above the threshold is
//! zstd-compressed and tagged so readers can reverse it.

use serde_json::Value;

use super::models::CompressType;
use crate::error::{Error, Result};

/// Default compression threshold in bytes.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 1024;

const ZSTD_LEVEL: i32 = 3;

/// Serialize a payload, compressing when it exceeds `threshold` bytes.
pub fn encode_payload(value: &Value, threshold: usize) -> Result<(Vec<u8>, CompressType)> {
    let raw = serde_json::to_vec(value)?;
    if raw.len() <= threshold {
        return Ok((raw, CompressType::None));
    }
    let compressed = zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)?;
    Ok((compressed, CompressType::Zstd))
}

/// Reverse [`encode_payload`].
pub fn decode_payload(bytes: &[u8], compress: CompressType) -> Result<Value> {
    let raw = match compress {
        CompressType::None => bytes.to_vec(),
        CompressType::Zstd => zstd::decode_all(bytes)?,
    };
    serde_json::from_slice(&raw)
        .map_err(|e| Error::Storage(format!("Corrupt payload ({:?}): {}", compress, e)))
}
