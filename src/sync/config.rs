//! Synchronization core configuration.
//!
//! Controlled via the `[sync]` table of `almanac.toml`.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_STALE_AFTER_MS: u64 = 30_000;
const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;
const DEFAULT_GC_IDLE_MS: u64 = 300_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Staleness window of entries that do not set their own.
    pub stale_after_ms: u64,
    /// Interval between garbage-collection sweeps.
    pub gc_interval_ms: u64,
    /// Unobserved entries untouched for this long are collected.
    pub gc_idle_ms: u64,
    pub enable_gc: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
            gc_idle_ms: DEFAULT_GC_IDLE_MS,
            enable_gc: true,
        }
    }
}

impl From<&crate::config::SyncSettings> for SyncConfig {
    fn from(settings: &crate::config::SyncSettings) -> Self {
        Self {
            stale_after_ms: settings.stale_after_ms,
            gc_interval_ms: settings.gc_interval_ms,
            gc_idle_ms: settings.gc_idle_ms,
            enable_gc: settings.enable_gc,
        }
    }
}

impl SyncConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Sweep interval, clamped to at least one millisecond.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }

    pub fn gc_idle(&self) -> Duration {
        Duration::from_millis(self.gc_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = SyncConfig::default();
        assert_eq!(config.stale_after(), Duration::from_secs(30));
        assert_eq!(config.gc_interval(), Duration::from_secs(60));
        assert_eq!(config.gc_idle(), Duration::from_secs(300));
        assert!(config.enable_gc);
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_value(serde_json::json!({ "stale_after_ms": 500 }))
                .expect("partial config deserializes");
        assert_eq!(config.stale_after(), Duration::from_millis(500));
        assert_eq!(config.gc_idle_ms, DEFAULT_GC_IDLE_MS);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let config = SyncConfig {
            gc_interval_ms: 0,
            ..SyncConfig::default()
        };
        assert_eq!(config.gc_interval(), Duration::from_millis(1));
    }
}
