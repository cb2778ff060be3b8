//! History-aware confidence adjustment.
//!
//! Blends one raw finding with the identity's recent screening history.
//! Rules are additive: each one that applies contributes to a signed
//! factor and appends a line to the reasoning trail, which is kept on the
//! output so every adjustment can be audited.

use chrono::{DateTime, Duration, Utc};

use crate::history::HistoryEntry;
use crate::risk::apply_reevaluation;
use crate::types::{clamp_confidence, AdjustedFinding, Finding, HistoryContext};

/// Historical confidence is not stored, so entries are scored with a
/// coarse proxy: positive analyses count as 50, negative ones as 20.
const PROXY_POSITIVE_CONFIDENCE: f32 = 50.0;
const PROXY_NEGATIVE_CONFIDENCE: f32 = 20.0;
const PROXY_DEFAULT_CONFIDENCE: f32 = 50.0;

const CONSISTENT_POSITIVE_RATE: f32 = 0.3;
const NEW_FINDING_MAX_RATE: f32 = 0.2;
const NEW_FINDING_MIN_CONFIDENCE: f32 = 60.0;
const FALSE_NEGATIVE_RATE: f32 = 0.5;
const FALSE_NEGATIVE_MAX_CONFIDENCE: f32 = 40.0;
const DEVIATION_THRESHOLD: f32 = 30.0;
const TREND_WINDOW: usize = 3;
const TREND_MIN_POSITIVES: usize = 2;

const BOOST_CONSISTENT: f32 = 0.15;
const BOOST_NEW_FINDING: f32 = 0.10;
const BOOST_FALSE_NEGATIVE: f32 = 0.20;
const BOOST_CAUTION: f32 = 0.05;
const SHIFT_DEVIATION: f32 = 0.05;
const BOOST_TREND_CONFIRMED: f32 = 0.10;
const BOOST_TREND_CONTRADICTED: f32 = 0.15;

/// Change in confidence (points) that triggers risk reevaluation.
const REEVALUATE_DELTA: f32 = 10.0;
const FLIP_MIN_CONFIDENCE: f32 = 50.0;
const FLIP_MIN_FACTOR: f32 = 0.1;

/// Window and minimum sample size for the adjustment to run.
#[derive(Debug, Clone, Copy)]
pub struct AdjustmentPolicy {
    pub recent_window: Duration,
    pub min_recent_entries: usize,
}

impl Default for AdjustmentPolicy {
    fn default() -> Self {
        Self {
            recent_window: Duration::days(30),
            min_recent_entries: 2,
        }
    }
}

/// Statistics over the recent window of one identity's history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryTrend {
    pub context: HistoryContext,
    /// Positives among the last three recent entries, when at least three exist.
    pub recent_positive_trend: Option<usize>,
}

/// Summarise the recent window, or `None` when it holds too few entries.
pub fn history_trend(
    history: &[HistoryEntry],
    now: DateTime<Utc>,
    policy: &AdjustmentPolicy,
) -> Option<HistoryTrend> {
    // A window reaching past the calendar's start covers everything.
    let cutoff = now.checked_sub_signed(policy.recent_window);
    let recent: Vec<&HistoryEntry> = history
        .iter()
        .filter(|e| cutoff.map_or(true, |c| e.timestamp > c))
        .collect();

    if recent.is_empty() || recent.len() < policy.min_recent_entries {
        return None;
    }

    let positives = recent.iter().filter(|e| e.has_positive_finding).count();
    let positive_rate = positives as f32 / recent.len() as f32;

    let proxies: Vec<f32> = recent
        .iter()
        .filter(|e| e.summary.regions_analyzed > 0)
        .map(|e| {
            if e.has_positive_finding {
                PROXY_POSITIVE_CONFIDENCE
            } else {
                PROXY_NEGATIVE_CONFIDENCE
            }
        })
        .collect();
    let avg_historical_confidence = if proxies.is_empty() {
        PROXY_DEFAULT_CONFIDENCE
    } else {
        proxies.iter().sum::<f32>() / proxies.len() as f32
    };

    let recent_positive_trend = (recent.len() >= TREND_WINDOW).then(|| {
        recent[recent.len() - TREND_WINDOW..]
            .iter()
            .filter(|e| e.has_positive_finding)
            .count()
    });

    Some(HistoryTrend {
        context: HistoryContext {
            positive_rate,
            recent_analyses_count: recent.len(),
            avg_historical_confidence,
        },
        recent_positive_trend,
    })
}

/// Adjust `finding` against `history` (the identity's prior entries).
pub fn adjust(
    history: &[HistoryEntry],
    finding: Finding,
    now: DateTime<Utc>,
    policy: &AdjustmentPolicy,
) -> AdjustedFinding {
    match history_trend(history, now, policy) {
        Some(trend) => adjust_with_trend(&trend, finding),
        None => AdjustedFinding::unchanged(finding),
    }
}

/// Apply the adjustment rules for an already computed trend.
pub fn adjust_with_trend(trend: &HistoryTrend, finding: Finding) -> AdjustedFinding {
    let mut adjusted = AdjustedFinding::unchanged(finding);
    let original = adjusted.original_confidence;
    let detected = adjusted.finding.leukocoria_detected;
    let rate = trend.context.positive_rate;
    let avg = trend.context.avg_historical_confidence;

    let mut factor = 0.0f32;
    let mut reasoning = Vec::new();

    if rate > CONSISTENT_POSITIVE_RATE && detected {
        factor += BOOST_CONSISTENT;
        reasoning.push(format!(
            "Consistent with {:.0}% positive history",
            rate * 100.0
        ));
    }
    if rate < NEW_FINDING_MAX_RATE && detected && original > NEW_FINDING_MIN_CONFIDENCE {
        factor += BOOST_NEW_FINDING;
        reasoning.push("New concerning finding - monitor closely".to_string());
    }
    if rate > FALSE_NEGATIVE_RATE && !detected {
        if original < FALSE_NEGATIVE_MAX_CONFIDENCE {
            factor += BOOST_FALSE_NEGATIVE;
            reasoning.push(
                "Low confidence with positive history - possible false negative".to_string(),
            );
        } else {
            factor += BOOST_CAUTION;
            reasoning.push("No detection but positive history warrants caution".to_string());
        }
    }

    if (original - avg).abs() > DEVIATION_THRESHOLD {
        if original > avg {
            factor += SHIFT_DEVIATION;
            reasoning.push("Higher confidence than historical average".to_string());
        } else {
            factor -= SHIFT_DEVIATION;
            reasoning.push("Lower confidence than historical average".to_string());
        }
    }

    if let Some(positives) = trend.recent_positive_trend {
        if positives >= TREND_MIN_POSITIVES {
            if detected {
                factor += BOOST_TREND_CONFIRMED;
                reasoning.push("Consistent with recent positive trend".to_string());
            } else {
                factor += BOOST_TREND_CONTRADICTED;
                reasoning.push(
                    "Inconsistent with recent positive trend - increase sensitivity".to_string(),
                );
            }
        }
    }

    if factor == 0.0 {
        return adjusted;
    }

    let new_confidence = clamp_confidence(original * (1.0 + factor));
    adjusted.finding.confidence = new_confidence;
    adjusted.adjustment_factor = factor;
    adjusted.confidence_adjusted = true;
    adjusted.history_summary = Some(trend.context);
    adjusted.history_note = Some(format!(
        "Confidence adjusted by {:+.1}% based on patient history.",
        factor * 100.0
    ));

    if (new_confidence - original).abs() > REEVALUATE_DELTA {
        apply_reevaluation(&mut adjusted);
    }

    if !detected && new_confidence > FLIP_MIN_CONFIDENCE && factor > FLIP_MIN_FACTOR {
        adjusted.finding.leukocoria_detected = true;
        adjusted.detection_changed_by_history = true;
        reasoning.push("Detection status changed based on patient history".to_string());
    }

    adjusted.adjustment_reasoning = reasoning;
    adjusted
}
