//! MessagePack codec using `rmp-serde`.

use serde_json::Value;

use super::Codec;
use crate::error::CacheError;

/// Compact binary codec; payloads are smaller than JSON but not readable
/// from `redis-cli`.
#[derive(Debug, Default, Clone)]
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn encode(&self, key: &str, value: &Value) -> Result<Vec<u8>, CacheError> {
        rmp_serde::to_vec(value).map_err(|e| CacheError::Serialization {
            key: key.to_owned(),
            codec: self.name(),
            source: e.into(),
        })
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<Value, CacheError> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::Serialization {
            key: key.to_owned(),
            codec: self.name(),
            source: e.into(),
        })
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }
}
