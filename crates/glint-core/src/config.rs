use chrono::Duration;
use serde::Deserialize;

use crate::adjust::AdjustmentPolicy;

/// Tracking parameters. Deserialisable from a `[tracking]` TOML table;
/// missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// A match is accepted when distance < 1 - similarity_threshold.
    pub similarity_threshold: f32,
    /// Maximum history entries kept per identity.
    pub max_history: usize,
    /// Trailing window (days) the adjustment engine looks at.
    pub recent_window_days: u32,
    /// Recent entries required before any adjustment is made.
    pub min_recent_entries: usize,
    /// Entries older than this many days are pruned. 0 disables pruning.
    pub retention_days: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            max_history: 10,
            recent_window_days: 30,
            min_recent_entries: 2,
            retention_days: 365,
        }
    }
}

impl TrackingConfig {
    /// Largest descriptor distance still accepted as the same face.
    pub fn match_distance(&self) -> f32 {
        1.0 - self.similarity_threshold
    }

    pub fn adjustment_policy(&self) -> AdjustmentPolicy {
        AdjustmentPolicy {
            recent_window: Duration::days(i64::from(self.recent_window_days)),
            min_recent_entries: self.min_recent_entries,
        }
    }

    pub fn retention(&self) -> Option<Duration> {
        (self.retention_days > 0).then(|| Duration::days(i64::from(self.retention_days)))
    }
}
