//! Error taxonomy.
//!
//! Three failure classes surface to callers: codec failures, loader
//! failures, and transport errors against the shared store. Lock contention
//! is not an error — a contended refresh or stats cycle is skipped and
//! logged, never raised.

use thiserror::Error;

/// Convenience alias for cache operation results.
pub type CacheResult<T> = Result<T, CacheError>;

/// Failures surfaced by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Codec failure while reading or writing a cached value. The caller may
    /// choose to purge the offending entry and retry once.
    #[error("serialization failed for cache key `{key}` ({codec})")]
    Serialization {
        /// The key whose payload failed to encode or decode.
        key: String,
        /// Name of the codec that produced the failure.
        codec: &'static str,
        /// Underlying codec error.
        #[source]
        source: anyhow::Error,
    },

    /// The value-producing function raised. Callers parked on the same key
    /// are woken when this happens; the error reaches only the caller whose
    /// loader ran.
    #[error("loader failed for cache key `{key}`")]
    Loader {
        /// The key being loaded.
        key: String,
        /// The loader's original error.
        #[source]
        source: anyhow::Error,
    },

    /// Transport or protocol error talking to the shared store. Not retried
    /// internally beyond the single call.
    #[error("remote store error")]
    RemoteStore(#[from] redis::RedisError),
}

impl CacheError {
    /// The cache key the failure is associated with, when there is one.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Serialization { key, .. } | Self::Loader { key, .. } => Some(key),
            Self::RemoteStore(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_failure_carries_key_and_cause() {
        let err = CacheError::Loader {
            key: "user:1".to_owned(),
            source: anyhow::anyhow!("db down"),
        };
        assert_eq!(err.key(), Some("user:1"));
        assert!(err.to_string().contains("user:1"));
        let source = std::error::Error::source(&err);
        assert!(source.is_some_and(|s| s.to_string().contains("db down")));
    }
}
