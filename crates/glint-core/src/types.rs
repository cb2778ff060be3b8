use serde::{Deserialize, Serialize};

use crate::error::TrackingError;

/// Axis-aligned box in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Which eye a detected region was labelled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    Left,
    Right,
    Center,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Eye region produced by the external landmark detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EyeRegion {
    pub id: String,
    pub bbox: BoundingBox,
    #[serde(rename = "type", default)]
    pub kind: RegionKind,
    #[serde(default)]
    pub source_confidence: f32,
}

/// Face descriptor vector produced by the external extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceDescriptor {
    pub values: Vec<f32>,
}

impl FaceDescriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Reject empty vectors and NaN/Inf components.
    pub fn validate(&self) -> Result<(), TrackingError> {
        if self.values.is_empty() {
            return Err(TrackingError::InvalidDescriptor("empty vector".into()));
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err(TrackingError::InvalidDescriptor(
                "non-finite component".into(),
            ));
        }
        Ok(())
    }

    /// Euclidean distance. Descriptors of different dimension never match,
    /// so the distance is infinite.
    pub fn euclidean_distance(&self, other: &FaceDescriptor) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Recommended clinical response time. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Routine,
    Soon,
    Urgent,
    Immediate,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Routine => "routine",
            Urgency::Soon => "soon",
            Urgency::Urgent => "urgent",
            Urgency::Immediate => "immediate",
        }
    }
}

/// One region's raw diagnostic result from the inference oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub region_id: String,
    pub leukocoria_detected: bool,
    /// Percentage in [0, 100].
    pub confidence: f32,
    pub risk_level: RiskLevel,
    pub urgency: Urgency,
    #[serde(default)]
    pub medical_reasoning: String,
}

/// Clamp a confidence into [0, 100]; NaN collapses to 0.
pub fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 100.0)
    }
}

/// Identity history statistics the adjustment was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryContext {
    pub positive_rate: f32,
    pub recent_analyses_count: usize,
    pub avg_historical_confidence: f32,
}

/// A finding after blending with the identity's screening history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustedFinding {
    #[serde(flatten)]
    pub finding: Finding,
    pub original_confidence: f32,
    pub adjustment_factor: f32,
    pub adjustment_reasoning: Vec<String>,
    pub history_summary: Option<HistoryContext>,
    pub confidence_adjusted: bool,
    pub detection_changed_by_history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_note: Option<String>,
}

impl AdjustedFinding {
    /// Pass a finding through untouched, apart from confidence clamping.
    pub fn unchanged(finding: Finding) -> Self {
        let mut finding = finding;
        finding.confidence = clamp_confidence(finding.confidence);
        Self {
            original_confidence: finding.confidence,
            finding,
            adjustment_factor: 0.0,
            adjustment_reasoning: Vec::new(),
            history_summary: None,
            confidence_adjusted: false,
            detection_changed_by_history: false,
            recommendation_note: None,
            history_note: None,
        }
    }
}
