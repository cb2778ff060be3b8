//! glint-core — Identity resolution and history-aware confidence adjustment.
//!
//! Links each observed face to a stable identity by nearest-neighbour
//! matching over face descriptors, keeps a bounded screening history per
//! identity, and blends each new leukocoria finding with that history to
//! produce an adjusted, auditable risk classification.

pub mod adjust;
pub mod config;
pub mod error;
pub mod geometry;
pub mod history;
pub mod identity;
pub mod index;
pub mod persist;
pub mod pipeline;
pub mod report;
pub mod risk;
pub mod summary;
pub mod tracker;
pub mod types;

pub use config::TrackingConfig;
pub use error::TrackingError;
pub use history::{AnalysisSummary, HistoryEntry};
pub use identity::Identity;
pub use persist::{JsonFileBackend, MemoryBackend, Snapshot, SnapshotBackend};
pub use pipeline::{AnalysisOutcome, AnalysisRequest, DescriptorProvider, PrecomputedDescriptors};
pub use summary::{AdjustmentSummary, IdentitySummary};
pub use tracker::{IdentityTracker, Resolution, TrackerStatistics};
pub use types::{
    AdjustedFinding, BoundingBox, EyeRegion, FaceDescriptor, Finding, RegionKind, RiskLevel,
    Urgency,
};
