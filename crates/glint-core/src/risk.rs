//! Risk/urgency reevaluation after a history adjustment.

use crate::types::{AdjustedFinding, RiskLevel, Urgency};

const HIGH_CONFIDENCE: f32 = 85.0;
const HIGH_CONFIDENCE_WITH_HISTORY: f32 = 75.0;
const MODERATE_CONFIDENCE: f32 = 65.0;
const MODERATE_CONFIDENCE_WITH_HISTORY: f32 = 55.0;
const SOON_CONFIDENCE: f32 = 45.0;
const MONITOR_CONFIDENCE: f32 = 30.0;

const HIGH_NOTE: &str = "High confidence with patient history support.";
const MODERATE_NOTE: &str = "Moderate confidence enhanced by patient history.";
const MONITOR_NOTE: &str = "Continue close monitoring due to patient history";

/// Outcome of the risk state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskTransition {
    Assign {
        risk: RiskLevel,
        urgency: Urgency,
    },
    /// Keep whatever risk and urgency the finding already carries.
    Unchanged,
}

/// Map (detected, confidence, history_adjusted) to a risk transition.
///
/// Total over every input, including NaN confidence, which falls through
/// all thresholds.
pub fn reevaluate(detected: bool, confidence: f32, history_adjusted: bool) -> RiskTransition {
    use RiskTransition::{Assign, Unchanged};

    if detected {
        let (risk, urgency) = if confidence >= HIGH_CONFIDENCE
            || (confidence >= HIGH_CONFIDENCE_WITH_HISTORY && history_adjusted)
        {
            (RiskLevel::High, Urgency::Immediate)
        } else if confidence >= MODERATE_CONFIDENCE
            || (confidence >= MODERATE_CONFIDENCE_WITH_HISTORY && history_adjusted)
        {
            (RiskLevel::Medium, Urgency::Urgent)
        } else if confidence >= SOON_CONFIDENCE {
            (RiskLevel::Medium, Urgency::Soon)
        } else {
            (RiskLevel::Low, Urgency::Routine)
        };
        Assign { risk, urgency }
    } else if history_adjusted && confidence > MONITOR_CONFIDENCE {
        Assign {
            risk: RiskLevel::Low,
            urgency: Urgency::Soon,
        }
    } else {
        Unchanged
    }
}

/// Run the state machine on an adjusted finding and annotate it.
pub fn apply_reevaluation(adjusted: &mut AdjustedFinding) {
    let finding = &mut adjusted.finding;
    let transition = reevaluate(
        finding.leukocoria_detected,
        finding.confidence,
        adjusted.confidence_adjusted,
    );

    let RiskTransition::Assign { risk, urgency } = transition else {
        return;
    };
    finding.risk_level = risk;
    finding.urgency = urgency;

    if !adjusted.confidence_adjusted {
        return;
    }
    match (finding.leukocoria_detected, urgency) {
        (true, Urgency::Immediate) => append_reasoning(&mut finding.medical_reasoning, HIGH_NOTE),
        (true, Urgency::Urgent) => {
            append_reasoning(&mut finding.medical_reasoning, MODERATE_NOTE)
        }
        (false, _) => adjusted.recommendation_note = Some(MONITOR_NOTE.to_string()),
        _ => {}
    }
}

fn append_reasoning(reasoning: &mut String, note: &str) {
    if !reasoning.is_empty() {
        reasoning.push(' ');
    }
    reasoning.push_str(note);
}
