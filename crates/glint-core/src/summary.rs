//! Read-only longitudinal summaries and recommendations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::HistoryEntry;
use crate::identity::Identity;
use crate::types::Urgency;

const RECENT_ANALYSES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub identity_id: String,
    pub total_analyses: usize,
    pub positive_analyses: usize,
    /// Percentage of analyses with a positive finding.
    pub consistency_rate: f32,
    pub recommendation: String,
    pub urgency: Urgency,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub seen_count: u32,
    pub recent_analyses: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentSummary {
    pub identity_id: String,
    pub total_analyses: usize,
    pub adjustments_applied: usize,
    /// Percentage of analyses in which history changed a confidence.
    pub adjustment_rate: f32,
    pub positive_analyses: usize,
    pub positive_rate: f32,
    pub confidence_system_active: bool,
}

/// Urgency and recommendation text for a history's positive counts.
pub fn recommend(total: usize, positive: usize) -> (Urgency, &'static str) {
    if total == 0 {
        return (Urgency::Routine, "No analysis history available");
    }
    let rate = percent(positive, total);
    if positive >= 2 {
        (
            Urgency::Immediate,
            "URGENT: Multiple positive findings - immediate medical consultation required",
        )
    } else if positive == 1 && total >= 2 {
        (
            Urgency::Soon,
            "MONITOR: One positive finding - follow-up recommended",
        )
    } else if rate > 50.0 {
        (
            Urgency::Urgent,
            "EVALUATE: Concerning pattern - medical evaluation advised",
        )
    } else {
        (
            Urgency::Routine,
            "CONTINUE: Regular monitoring - no immediate concerns",
        )
    }
}

/// Follow-up advice shown in exported reports.
pub fn monitoring_advice(urgency: Urgency) -> &'static str {
    match urgency {
        Urgency::Immediate => {
            "Contact pediatric ophthalmologist immediately. Multiple positive findings \
             require urgent professional evaluation. Do not delay seeking medical attention."
        }
        Urgency::Urgent => {
            "Schedule ophthalmologist appointment within 1-2 weeks. Concerning pattern \
             detected that warrants professional evaluation."
        }
        Urgency::Soon => {
            "Consider ophthalmologist consultation within 1 month. Continue regular \
             photo monitoring and watch for any changes."
        }
        Urgency::Routine => {
            "Continue regular photo monitoring. Take photos monthly under good lighting \
             conditions. No immediate medical concerns detected."
        }
    }
}

pub fn summarize(id: &str, identity: Option<&Identity>, history: &[HistoryEntry]) -> IdentitySummary {
    let total = history.len();
    let positive = history.iter().filter(|e| e.has_positive_finding).count();
    let (urgency, recommendation) = recommend(total, positive);
    let recent_start = total.saturating_sub(RECENT_ANALYSES);

    IdentitySummary {
        identity_id: id.to_string(),
        total_analyses: total,
        positive_analyses: positive,
        consistency_rate: percent(positive, total),
        recommendation: recommendation.to_string(),
        urgency,
        first_seen: identity.map(|i| i.first_seen),
        last_seen: identity.map(|i| i.last_seen),
        seen_count: identity.map(|i| i.seen_count).unwrap_or(0),
        recent_analyses: history[recent_start..].to_vec(),
    }
}

pub fn summarize_adjustments(id: &str, history: &[HistoryEntry]) -> AdjustmentSummary {
    let total = history.len();
    let adjusted = history
        .iter()
        .filter(|e| e.summary.adjusted_regions > 0)
        .count();
    let positive = history.iter().filter(|e| e.has_positive_finding).count();

    AdjustmentSummary {
        identity_id: id.to_string(),
        total_analyses: total,
        adjustments_applied: adjusted,
        adjustment_rate: percent(adjusted, total),
        positive_analyses: positive,
        positive_rate: percent(positive, total),
        confidence_system_active: adjusted > 0,
    }
}

/// Most urgent first, then most positives, then most analyses, then id.
pub fn sort_by_priority(summaries: &mut [IdentitySummary]) {
    summaries.sort_by(|a, b| {
        b.urgency
            .cmp(&a.urgency)
            .then(b.positive_analyses.cmp(&a.positive_analyses))
            .then(b.total_analyses.cmp(&a.total_analyses))
            .then_with(|| a.identity_id.cmp(&b.identity_id))
    });
}

fn percent(part: usize, total: usize) -> f32 {
    if total == 0 {
        0.0
    } else {
        part as f32 / total as f32 * 100.0
    }
}
