//! Value codecs.
//!
//! The remote tier stores opaque bytes; a [`Codec`] turns cached values into
//! bytes and back. JSON is the default; a msgpack codec is available behind
//! the `msgpack` feature.

mod json;
pub use json::JsonCodec;

#[cfg(feature = "msgpack")]
mod msgpack;
#[cfg(feature = "msgpack")]
pub use msgpack::MsgpackCodec;

use std::fmt::Debug;

use serde_json::Value;

use crate::error::CacheError;

/// Byte encoder/decoder for cached values.
///
/// Implementations must be `Send + Sync + Debug`; the tiers hold them behind
/// `Arc<dyn Codec>` and call them from concurrent tasks. The `key` argument
/// is only for error context.
pub trait Codec: Send + Sync + Debug {
    /// Serialize a value to bytes.
    ///
    /// # Errors
    ///
    /// [`CacheError::Serialization`] when the value cannot be encoded.
    fn encode(&self, key: &str, value: &Value) -> Result<Vec<u8>, CacheError>;

    /// Deserialize bytes to a value.
    ///
    /// # Errors
    ///
    /// [`CacheError::Serialization`] when the payload cannot be decoded.
    fn decode(&self, key: &str, bytes: &[u8]) -> Result<Value, CacheError>;

    /// Codec name, for logs and error context.
    fn name(&self) -> &'static str;
}
