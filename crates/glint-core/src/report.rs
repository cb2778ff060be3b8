//! Longitudinal report export.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrackingError;
use crate::history::HistoryEntry;
use crate::identity::Identity;
use crate::summary::{monitoring_advice, IdentitySummary};
use crate::types::{RegionKind, Urgency};

const REPORT_TYPE: &str = "longitudinal_analysis";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportInfo {
    pub identity_id: String,
    pub generated_at: DateTime<Utc>,
    pub report_type: String,
}

/// Identity metadata for reports. The prototype descriptor itself is
/// biometric data and never leaves the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityMetadata {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub seen_count: u32,
    pub descriptor_dim: usize,
    pub first_region_kind: RegionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendations {
    pub medical_action: String,
    pub urgency_level: Urgency,
    pub monitoring_advice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityReport {
    pub report_info: ReportInfo,
    pub summary: IdentitySummary,
    pub detailed_history: Vec<HistoryEntry>,
    pub identity: Option<IdentityMetadata>,
    pub recommendations: Recommendations,
}

impl IdentityReport {
    pub fn build(
        summary: IdentitySummary,
        identity: Option<&Identity>,
        history: &[HistoryEntry],
        now: DateTime<Utc>,
    ) -> Self {
        let recommendations = Recommendations {
            medical_action: summary.recommendation.clone(),
            urgency_level: summary.urgency,
            monitoring_advice: monitoring_advice(summary.urgency).to_string(),
        };
        Self {
            report_info: ReportInfo {
                identity_id: summary.identity_id.clone(),
                generated_at: now,
                report_type: REPORT_TYPE.to_string(),
            },
            identity: identity.map(|i| IdentityMetadata {
                first_seen: i.first_seen,
                last_seen: i.last_seen,
                seen_count: i.seen_count,
                descriptor_dim: i.prototype.dim(),
                first_region_kind: i.first_region_kind,
            }),
            detailed_history: history.to_vec(),
            summary,
            recommendations,
        }
    }

    /// Write the report as pretty JSON into `dir` and return its path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, TrackingError> {
        let file_name = format!(
            "identity_report_{}_{}.json",
            self.report_info.identity_id,
            self.report_info.generated_at.format("%Y%m%d_%H%M%S")
        );
        let path = dir.join(file_name);

        std::fs::create_dir_all(dir)
            .map_err(|e| TrackingError::Report(format!("{}: {e}", dir.display())))?;
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| TrackingError::Report(e.to_string()))?;
        std::fs::write(&path, bytes)
            .map_err(|e| TrackingError::Report(format!("{}: {e}", path.display())))?;

        tracing::info!(path = %path.display(), "identity report exported");
        Ok(path)
    }
}
