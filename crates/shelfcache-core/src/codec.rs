//! JSON payload helpers for callers that store serde types.
//!
//! The cache stores opaque bytes; decoding happens here, at the caller's
//! boundary. Unknown fields are tolerated by serde's default behaviour, so
//! payloads written by newer clients still decode.

use crate::error::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CacheError::Json {
        message: format!("Failed to encode cache payload: {}", e),
        source: Some(e),
    })
}

/// Decode one payload, reporting failure as [`CacheError::CorruptEntry`].
pub fn decode<T: DeserializeOwned>(namespace: &str, key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| CacheError::CorruptEntry {
        namespace: namespace.to_string(),
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Payloads decoded from one namespace, with the keys that failed.
#[derive(Debug, Clone)]
pub struct DecodedBatch<T> {
    pub items: Vec<(String, T)>,
    pub skipped: Vec<String>,
}

impl<T> Default for DecodedBatch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// Decode many payloads, skipping corrupt ones.
///
/// One bad payload never aborts the batch; each skip is logged and the
/// skipped keys are returned so callers can evict them.
pub fn decode_batch<T: DeserializeOwned>(
    namespace: &str,
    rows: impl IntoIterator<Item = (String, Vec<u8>)>,
) -> DecodedBatch<T> {
    let mut batch = DecodedBatch::default();
    for (key, bytes) in rows {
        match decode(namespace, &key, &bytes) {
            Ok(item) => batch.items.push((key, item)),
            Err(e) => {
                warn!("{}", e);
                batch.skipped.push(key);
            }
        }
    }
    if !batch.skipped.is_empty() {
        warn!(
            "Skipped {} corrupt payloads in namespace {}",
            batch.skipped.len(),
            namespace
        );
    }
    batch
}
