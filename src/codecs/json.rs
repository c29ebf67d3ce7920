//! JSON codec backed by `serde_json`

use crate::traits::CacheCodec;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON codec, the default for [`CacheClient`](crate::CacheClient)
///
/// JSON never encodes a value to zero bytes, so its output can't be confused
/// with the empty null marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).context("failed to encode cache value as JSON")
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).with_context(|| {
            format!(
                "failed to decode {} from cached JSON",
                std::any::type_name::<T>()
            )
        })
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}
