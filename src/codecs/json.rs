//! JSON codec using `serde_json`.

use serde_json::Value;

use super::Codec;
use crate::error::CacheError;

/// The default codec: values stored as compact JSON.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, key: &str, value: &Value) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(value).map_err(|e| CacheError::Serialization {
            key: key.to_owned(),
            codec: self.name(),
            source: e.into(),
        })
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<Value, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization {
            key: key.to_owned(),
            codec: self.name(),
            source: e.into(),
        })
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_survives_the_codec_as_a_value() {
        let codec = JsonCodec;
        let bytes = codec.encode("k", &Value::Null).unwrap();
        assert_eq!(codec.decode("k", &bytes).unwrap(), Value::Null);
    }

    #[test]
    fn decode_failure_names_key_and_codec() {
        let codec = JsonCodec;
        let err = codec.decode("user:1", b"{not json").unwrap_err();
        match err {
            CacheError::Serialization { key, codec, .. } => {
                assert_eq!(key, "user:1");
                assert_eq!(codec, "serde_json");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn structured_values_round_trip() {
        let codec = JsonCodec;
        let value = json!({"id": 7, "name": "alice", "tags": ["a", "b"]});
        let bytes = codec.encode("k", &value).unwrap();
        assert_eq!(codec.decode("k", &bytes).unwrap(), value);
    }
}
