//! Per-identity bounded screening history.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrackingError;

/// Aggregate of one completed analysis for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub regions_analyzed: u32,
    pub positive_detections: u32,
    #[serde(default = "unknown_method")]
    pub method: String,
    /// Regions whose confidence was changed by history at record time.
    #[serde(default)]
    pub adjusted_regions: u32,
}

fn unknown_method() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub image_reference: String,
    pub has_positive_finding: bool,
    pub summary: AnalysisSummary,
}

/// Append-only, FIFO-truncated history per identity id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryTable {
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<HistoryEntry>>,
}

impl HistoryTable {
    /// History for `id`, oldest first. Empty for unknown ids.
    pub fn get(&self, id: &str) -> &[HistoryEntry] {
        self.entries.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start an empty history for a newly created identity.
    pub fn open(&mut self, id: &str) {
        self.entries.entry(id.to_string()).or_default();
    }

    /// Append `entry`, then drop entries past `retention` and keep only the
    /// newest `max_history`. Returns how many entries were dropped.
    pub fn append(
        &mut self,
        id: &str,
        entry: HistoryEntry,
        max_history: usize,
        retention: Option<Duration>,
        now: DateTime<Utc>,
    ) -> usize {
        let list = self.entries.entry(id.to_string()).or_default();
        list.push(entry);

        let before = list.len();
        if let Some(cutoff) = retention.and_then(|r| now.checked_sub_signed(r)) {
            list.retain(|e| e.timestamp >= cutoff);
        }
        if list.len() > max_history {
            let excess = list.len() - max_history;
            list.drain(..excess);
        }
        before - list.len()
    }

    /// Truncate every history to `max_history`, reporting each violation.
    ///
    /// `append` keeps the bound, so this only fires for snapshots written
    /// with a larger limit or edited by hand.
    pub fn enforce_bounds(&mut self, max_history: usize) -> Vec<TrackingError> {
        let mut violations = Vec::new();
        for (id, list) in self.entries.iter_mut() {
            if list.len() > max_history {
                violations.push(TrackingError::HistoryBoundsViolation {
                    identity: id.clone(),
                    len: list.len(),
                    max: max_history,
                });
                let excess = list.len() - max_history;
                list.drain(..excess);
            }
        }
        violations
    }

    /// Drop entries older than `cutoff` across all identities.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        for list in self.entries.values_mut() {
            let before = list.len();
            list.retain(|e| e.timestamp >= cutoff);
            dropped += before - list.len();
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(at: DateTime<Utc>, positive: bool) -> HistoryEntry {
        HistoryEntry {
            timestamp: at,
            image_reference: format!("img_{}.jpg", at.timestamp()),
            has_positive_finding: positive,
            summary: AnalysisSummary {
                regions_analyzed: 2,
                positive_detections: u32::from(positive),
                method: "test".into(),
                adjusted_regions: 0,
            },
        }
    }

    #[test]
    fn test_append_truncates_fifo() {
        let mut table = HistoryTable::default();
        let base = Utc::now();
        for i in 0..13 {
            let at = base + Duration::seconds(i);
            table.append("child_0001", entry(at, i % 2 == 0), 10, None, at);
        }
        let list = table.get("child_0001");
        assert_eq!(list.len(), 10);
        // Oldest three dropped
        assert_eq!(list[0].timestamp, base + Duration::seconds(3));
        assert_eq!(list[9].timestamp, base + Duration::seconds(12));
    }

    #[test]
    fn test_append_prunes_retention() {
        let mut table = HistoryTable::default();
        let now = Utc::now();
        table.append("a", entry(now - Duration::days(400), true), 10, None, now);
        let dropped = table.append(
            "a",
            entry(now, false),
            10,
            Some(Duration::days(365)),
            now,
        );
        assert_eq!(dropped, 1);
        assert_eq!(table.get("a").len(), 1);
        assert!(!table.get("a")[0].has_positive_finding);
    }

    #[test]
    fn test_append_with_unbounded_retention() {
        let mut table = HistoryTable::default();
        let now = Utc::now();
        table.append("a", entry(now - Duration::days(4000), true), 10, None, now);
        let dropped = table.append(
            "a",
            entry(now, false),
            10,
            Some(Duration::days(i64::from(u32::MAX))),
            now,
        );
        assert_eq!(dropped, 0);
        assert_eq!(table.get("a").len(), 2);
    }

    #[test]
    fn test_get_unknown_is_empty() {
        let table = HistoryTable::default();
        assert!(table.get("nobody").is_empty());
        assert!(!table.contains("nobody"));
    }

    #[test]
    fn test_enforce_bounds_reports_violation() {
        let mut table = HistoryTable::default();
        let now = Utc::now();
        table
            .entries
            .insert("a".into(), (0..12).map(|_| entry(now, false)).collect());
        table
            .entries
            .insert("b".into(), (0..3).map(|_| entry(now, false)).collect());

        let violations = table.enforce_bounds(10);
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            &violations[0],
            TrackingError::HistoryBoundsViolation { identity, len: 12, max: 10 } if identity == "a"
        ));
        assert_eq!(table.get("a").len(), 10);
        assert_eq!(table.get("b").len(), 3);
    }

    #[test]
    fn test_legacy_summary_defaults() {
        let json = r#"{"regions_analyzed":2,"positive_detections":1}"#;
        let summary: AnalysisSummary = serde_json::from_str(json).unwrap();
        assert_eq!(summary.method, "unknown");
        assert_eq!(summary.adjusted_regions, 0);
    }
}
