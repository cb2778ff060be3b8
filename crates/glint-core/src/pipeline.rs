//! Types for the per-image analysis pipeline.
//!
//! Region list → face box estimate → descriptor → identity → history →
//! adjusted findings. The orchestration itself lives on
//! [`IdentityTracker::process_analysis`](crate::IdentityTracker::process_analysis).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::TrackingError;
use crate::types::{AdjustedFinding, BoundingBox, EyeRegion, FaceDescriptor, Finding};

/// External face-descriptor extractor.
pub trait DescriptorProvider {
    /// Descriptor for the face estimated to contain `region`.
    fn extract(
        &self,
        region: &EyeRegion,
        face_box: &BoundingBox,
    ) -> Result<FaceDescriptor, TrackingError>;
}

/// Descriptors computed upstream, keyed by region id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrecomputedDescriptors {
    by_region: HashMap<String, FaceDescriptor>,
}

impl PrecomputedDescriptors {
    pub fn new(by_region: HashMap<String, FaceDescriptor>) -> Self {
        Self { by_region }
    }

    pub fn insert(&mut self, region_id: impl Into<String>, descriptor: FaceDescriptor) {
        self.by_region.insert(region_id.into(), descriptor);
    }
}

impl DescriptorProvider for PrecomputedDescriptors {
    fn extract(
        &self,
        region: &EyeRegion,
        _face_box: &BoundingBox,
    ) -> Result<FaceDescriptor, TrackingError> {
        self.by_region
            .get(&region.id)
            .cloned()
            .ok_or_else(|| TrackingError::DescriptorUnavailable {
                region_id: region.id.clone(),
                reason: "no descriptor supplied".to_string(),
            })
    }
}

/// One image's worth of detector regions and oracle findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub image_reference: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub regions: Vec<EyeRegion>,
    pub findings: Vec<Finding>,
}

fn default_method() -> String {
    "unknown".to_string()
}

/// How one region was linked to an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionTracking {
    pub region_id: String,
    pub identity_id: String,
    pub is_new: bool,
    /// `false` for the session-scoped pseudo-identity.
    pub tracked: bool,
    pub face_box: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    /// Informational weight for recognized faces; never applied to
    /// confidence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_boost: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub tracked_faces: usize,
    pub new_faces: usize,
    pub recognized_faces: usize,
    pub untracked_regions: usize,
    pub mappings: Vec<RegionTracking>,
    /// Same order as the request's findings.
    pub findings: Vec<AdjustedFinding>,
    pub processing_time_ms: u64,
}
