//! Tier settings and cache identity.
//!
//! A cache is identified process-wide by `(name, internal key)`, where the
//! internal key is derived from the expiry-relevant parts of its settings.
//! Two caches sharing a name but configured with different expiry times are
//! allowed, but flagged as a misconfiguration risk when registered.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the in-process tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSettings {
    /// Initial capacity hint for the backing map.
    pub initial_capacity: usize,
    /// Upper bound on resident entries; size-based eviction applies beyond it.
    pub max_entries: u64,
    /// Write-time TTL in seconds.
    pub ttl_secs: u64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            initial_capacity: 10,
            max_entries: 5000,
            ttl_secs: 300,
        }
    }
}

impl LocalSettings {
    /// Entry TTL as a [`Duration`].
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Settings for the shared Redis tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Entry TTL in seconds.
    pub ttl_secs: u64,
    /// Refresh-ahead window: a hit whose remaining TTL is at or below this
    /// many seconds triggers a refresh.
    pub preload_secs: u64,
    /// `true` recomputes the value on refresh (hard refresh, background);
    /// `false` only extends the TTL of the stored value (soft refresh).
    pub force_refresh: bool,
    /// Prefix stored keys with the cache name. Required for `clear()` to be
    /// able to find this cache's keys in the shared keyspace.
    pub use_prefix: bool,
    /// Cache logical-null loader results. When on, a null is stored as a
    /// marker entry with a fraction of the configured TTL; when off, a null
    /// result deletes the key instead.
    pub allow_null_values: bool,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 18_000,
            preload_secs: 60,
            force_refresh: false,
            use_prefix: true,
            allow_null_values: true,
        }
    }
}

impl RemoteSettings {
    /// Entry TTL as a [`Duration`].
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Which tiers a cache composes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierMode {
    /// In-process tier only; nothing is shared.
    LocalOnly,
    /// Shared tier only; every read goes to the store.
    RemoteOnly,
    /// Local tier in front of the remote tier (the default).
    #[default]
    Tiered,
}

/// Full per-cache configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierSettings {
    /// Tier composition.
    pub mode: TierMode,
    /// In-process tier settings.
    pub local: LocalSettings,
    /// Shared tier settings.
    pub remote: RemoteSettings,
    /// Free-text description surfaced in the durable stats record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TierSettings {
    /// Identity string distinguishing differently-configured caches that
    /// share a name: `"{local ttl}-{remote ttl}-{preload window}"`.
    #[must_use]
    pub fn internal_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.local.ttl_secs, self.remote.ttl_secs, self.remote.preload_secs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = TierSettings::default();
        assert_eq!(settings.local.initial_capacity, 10);
        assert_eq!(settings.local.max_entries, 5000);
        assert_eq!(settings.local.ttl_secs, 300);
        assert_eq!(settings.remote.ttl_secs, 18_000);
        assert_eq!(settings.remote.preload_secs, 60);
        assert!(!settings.remote.force_refresh);
        assert!(settings.remote.use_prefix);
        assert_eq!(settings.mode, TierMode::Tiered);
    }

    #[test]
    fn internal_key_derives_from_expiry_settings() {
        let settings = TierSettings::default();
        assert_eq!(settings.internal_key(), "300-18000-60");

        let mut other = settings.clone();
        other.remote.preload_secs = 30;
        assert_ne!(settings.internal_key(), other.internal_key());

        // Non-expiry settings do not change the identity.
        let mut same = settings.clone();
        same.remote.force_refresh = true;
        same.description = Some("users".to_owned());
        assert_eq!(settings.internal_key(), same.internal_key());
    }
}
