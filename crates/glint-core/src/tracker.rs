//! The identity tracker: resolver, history store and adjustment engine
//! behind one lock.
//!
//! All mutation goes through a single `Mutex`, so resolve-then-create and
//! history read-modify-write are serialized. Two concurrent requests for
//! the same new face therefore create exactly one identity. Snapshots are
//! handed to the backend while the lock is held so saves land in the same
//! order as the updates they capture.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adjust::adjust;
use crate::config::TrackingConfig;
use crate::error::TrackingError;
use crate::geometry::estimate_face_box;
use crate::history::{AnalysisSummary, HistoryEntry};
use crate::identity::Identity;
use crate::index::{DescriptorIndex, LinearScanIndex};
use crate::persist::{MemoryBackend, Snapshot, SnapshotBackend};
use crate::pipeline::{AnalysisOutcome, AnalysisRequest, DescriptorProvider, RegionTracking};
use crate::report::IdentityReport;
use crate::summary::{
    sort_by_priority, summarize, summarize_adjustments, AdjustmentSummary, IdentitySummary,
};
use crate::types::{AdjustedFinding, FaceDescriptor, Finding, RegionKind};

const SESSION_PREFIX: &str = "session_";
const SINGLE_FINDING_METHOD: &str = "single_finding";

const SEEN_BOOST_STEP: f32 = 0.1;
const SEEN_BOOST_MAX: f32 = 1.5;
const POSITIVE_BOOST_STEP: f32 = 0.15;
const POSITIVE_BOOST_MAX: f32 = 1.3;

/// Result of resolving one descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub identity_id: String,
    pub is_new: bool,
    /// Distance to the closest known prototype, if any existed.
    pub distance: Option<f32>,
}

/// Counters since start-up (or the last reset).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingStats {
    pub faces_processed: u64,
    pub new_identities: u64,
    pub recognitions: u64,
    pub confidence_adjustments: u64,
    pub untracked_regions: u64,
    pub persistence_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerStatistics {
    #[serde(flatten)]
    pub counters: TrackingStats,
    pub known_identities: usize,
    pub identities_with_history: usize,
    pub persistence: String,
}

struct TrackerState {
    tables: Snapshot,
    index: Box<dyn DescriptorIndex>,
    stats: TrackingStats,
}

pub struct IdentityTracker {
    config: TrackingConfig,
    state: Mutex<TrackerState>,
    backend: Box<dyn SnapshotBackend>,
}

impl IdentityTracker {
    /// Load state from `backend` and build the default linear-scan index.
    pub fn open(config: TrackingConfig, backend: Box<dyn SnapshotBackend>) -> Self {
        Self::with_index(config, backend, Box::new(LinearScanIndex::new()))
    }

    /// Tracker with no durable storage.
    pub fn in_memory(config: TrackingConfig) -> Self {
        Self::open(config, Box::new(MemoryBackend::new()))
    }

    pub fn with_index(
        config: TrackingConfig,
        backend: Box<dyn SnapshotBackend>,
        mut index: Box<dyn DescriptorIndex>,
    ) -> Self {
        let tables = load_snapshot(backend.as_ref(), &config);

        index.clear();
        for identity in tables.identities.identities.values() {
            index.insert(&identity.id, &identity.prototype);
        }

        tracing::info!(
            identities = tables.identities.len(),
            histories = tables.history.len(),
            next_id = tables.identities.next_id,
            backend = %backend.describe(),
            "identity tracker ready"
        );

        Self {
            config,
            state: Mutex::new(TrackerState {
                tables,
                index,
                stats: TrackingStats::default(),
            }),
            backend,
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Match `descriptor` against known prototypes, creating a new identity
    /// when nothing is close enough.
    pub fn resolve_identity(&self, descriptor: &FaceDescriptor) -> Result<Resolution, TrackingError> {
        descriptor.validate()?;
        let mut state = self.lock();
        let resolution = self.resolve_locked(&mut state, descriptor, RegionKind::Unknown, Utc::now());
        self.persist_locked(&mut state);
        Ok(resolution)
    }

    fn resolve_locked(
        &self,
        state: &mut TrackerState,
        descriptor: &FaceDescriptor,
        kind: RegionKind,
        now: DateTime<Utc>,
    ) -> Resolution {
        state.stats.faces_processed += 1;
        let nearest = state.index.nearest(descriptor);

        if let Some(nearest) = &nearest {
            if nearest.distance < self.config.match_distance()
                && state.tables.identities.touch(&nearest.identity_id, now)
            {
                state.stats.recognitions += 1;
                tracing::info!(
                    identity = %nearest.identity_id,
                    distance = nearest.distance,
                    "identity matched"
                );
                return Resolution {
                    identity_id: nearest.identity_id.clone(),
                    is_new: false,
                    distance: Some(nearest.distance),
                };
            }
        }

        let id = state
            .tables
            .identities
            .create(descriptor.clone(), kind, now)
            .id
            .clone();
        state.index.insert(&id, descriptor);
        state.tables.history.open(&id);
        state.stats.new_identities += 1;
        tracing::info!(
            identity = %id,
            closest = nearest.as_ref().map(|n| n.distance),
            "new identity created"
        );

        Resolution {
            identity_id: id,
            is_new: true,
            distance: nearest.map(|n| n.distance),
        }
    }

    /// Adjust one finding against the identity's prior history, then record
    /// it as a new history entry.
    ///
    /// Session-scoped ids pass the finding through untouched and record
    /// nothing.
    pub fn record_and_adjust(
        &self,
        identity_id: &str,
        finding: Finding,
        image_reference: &str,
    ) -> Result<AdjustedFinding, TrackingError> {
        let mut results = self.record_analysis(
            identity_id,
            vec![finding],
            image_reference,
            SINGLE_FINDING_METHOD,
        )?;
        // One finding in, one out.
        Ok(results.remove(0))
    }

    /// Adjust a batch of findings for one identity and record them as a
    /// single history entry.
    pub fn record_analysis(
        &self,
        identity_id: &str,
        findings: Vec<Finding>,
        image_reference: &str,
        method: &str,
    ) -> Result<Vec<AdjustedFinding>, TrackingError> {
        if is_session_id(identity_id) {
            return Ok(findings.into_iter().map(AdjustedFinding::unchanged).collect());
        }

        let mut state = self.lock();
        if state.tables.identities.get(identity_id).is_none()
            && !state.tables.history.contains(identity_id)
        {
            return Err(TrackingError::UnknownIdentity(identity_id.to_string()));
        }

        let now = Utc::now();
        let regions = findings.len();
        let adjusted = self.adjust_and_record_locked(
            &mut state,
            identity_id,
            findings,
            regions,
            image_reference,
            method,
            now,
        );
        self.persist_locked(&mut state);
        Ok(adjusted)
    }

    /// Adjust against the history as it stood before this analysis, then
    /// append one entry summarising the raw findings.
    #[allow(clippy::too_many_arguments)]
    fn adjust_and_record_locked(
        &self,
        state: &mut TrackerState,
        identity_id: &str,
        findings: Vec<Finding>,
        regions_analyzed: usize,
        image_reference: &str,
        method: &str,
        now: DateTime<Utc>,
    ) -> Vec<AdjustedFinding> {
        let policy = self.config.adjustment_policy();
        let positives = findings.iter().filter(|f| f.leukocoria_detected).count();

        let adjusted: Vec<AdjustedFinding> = {
            let history = state.tables.history.get(identity_id);
            findings
                .into_iter()
                .map(|finding| adjust(history, finding, now, &policy))
                .collect()
        };

        let mut adjusted_regions = 0u32;
        for result in adjusted.iter().filter(|r| r.confidence_adjusted) {
            adjusted_regions += 1;
            tracing::info!(
                identity = %identity_id,
                region = %result.finding.region_id,
                from = result.original_confidence,
                to = result.finding.confidence,
                factor = result.adjustment_factor,
                reasoning = ?result.adjustment_reasoning,
                "confidence adjusted by history"
            );
        }
        state.stats.confidence_adjustments += u64::from(adjusted_regions);

        let entry = HistoryEntry {
            timestamp: now,
            image_reference: image_reference.to_string(),
            has_positive_finding: positives > 0,
            summary: AnalysisSummary {
                regions_analyzed: saturating_u32(regions_analyzed),
                positive_detections: saturating_u32(positives),
                method: method.to_string(),
                adjusted_regions,
            },
        };
        let dropped = state.tables.history.append(
            identity_id,
            entry,
            self.config.max_history,
            self.config.retention(),
            now,
        );
        if dropped > 0 {
            tracing::debug!(identity = %identity_id, dropped, "old history entries dropped");
        }

        adjusted
    }

    /// Run the full per-image pipeline: estimate face boxes, extract
    /// descriptors, resolve identities, adjust and record findings.
    ///
    /// Never fails. Regions whose descriptor cannot be obtained are linked
    /// to a session-scoped pseudo-identity and their findings pass through.
    pub fn process_analysis(
        &self,
        provider: &dyn DescriptorProvider,
        request: AnalysisRequest,
    ) -> AnalysisOutcome {
        let started = Instant::now();

        // Extraction is external work; keep it outside the lock.
        let extracted: Vec<_> = request
            .regions
            .iter()
            .map(|region| {
                let face_box = estimate_face_box(&region.bbox);
                let descriptor = provider
                    .extract(region, &face_box)
                    .and_then(|d| d.validate().map(|()| d));
                (region, face_box, descriptor)
            })
            .collect();

        let mut state = self.lock();
        let now = Utc::now();
        let mut mappings = Vec::with_capacity(extracted.len());
        let (mut new_faces, mut recognized_faces, mut untracked) = (0usize, 0usize, 0usize);

        for (region, face_box, descriptor) in extracted {
            match descriptor {
                Ok(descriptor) => {
                    let resolution = self.resolve_locked(&mut state, &descriptor, region.kind, now);
                    let confidence_boost = if resolution.is_new {
                        new_faces += 1;
                        None
                    } else {
                        recognized_faces += 1;
                        Some(recognition_boost(&state.tables, &resolution.identity_id))
                    };
                    mappings.push(RegionTracking {
                        region_id: region.id.clone(),
                        identity_id: resolution.identity_id,
                        is_new: resolution.is_new,
                        tracked: true,
                        face_box,
                        distance: resolution.distance,
                        confidence_boost,
                    });
                }
                Err(e) => {
                    tracing::warn!(region = %region.id, error = %e, "region left untracked");
                    untracked += 1;
                    mappings.push(RegionTracking {
                        region_id: region.id.clone(),
                        identity_id: session_id(),
                        is_new: false,
                        tracked: false,
                        face_box,
                        distance: None,
                        confidence_boost: None,
                    });
                }
            }
        }
        state.stats.untracked_regions += untracked as u64;

        // Group findings by identity, remembering their output slots.
        let by_region: HashMap<&str, &RegionTracking> = mappings
            .iter()
            .map(|m| (m.region_id.as_str(), m))
            .collect();
        let mut groups: Vec<(String, usize, Vec<(usize, Finding)>)> = Vec::new();
        for mapping in mappings.iter().filter(|m| m.tracked) {
            match groups.iter_mut().find(|(id, _, _)| *id == mapping.identity_id) {
                Some((_, regions, _)) => *regions += 1,
                None => groups.push((mapping.identity_id.clone(), 1, Vec::new())),
            }
        }

        let mut slots: Vec<Option<AdjustedFinding>> = vec![None; request.findings.len()];
        for (slot, finding) in request.findings.into_iter().enumerate() {
            let tracked_identity = by_region
                .get(finding.region_id.as_str())
                .filter(|m| m.tracked)
                .map(|m| m.identity_id.as_str());
            match tracked_identity.and_then(|id| groups.iter_mut().find(|(g, _, _)| g == id)) {
                Some((_, _, group)) => group.push((slot, finding)),
                None => slots[slot] = Some(AdjustedFinding::unchanged(finding)),
            }
        }

        for (identity_id, regions, group) in groups {
            let (positions, findings): (Vec<usize>, Vec<Finding>) = group.into_iter().unzip();
            let adjusted = self.adjust_and_record_locked(
                &mut state,
                &identity_id,
                findings,
                regions,
                &request.image_reference,
                &request.method,
                now,
            );
            for (slot, result) in positions.into_iter().zip(adjusted) {
                slots[slot] = Some(result);
            }
        }

        self.persist_locked(&mut state);
        drop(state);

        let outcome = AnalysisOutcome {
            tracked_faces: mappings.iter().filter(|m| m.tracked).count(),
            new_faces,
            recognized_faces,
            untracked_regions: untracked,
            mappings,
            findings: slots.into_iter().flatten().collect(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            image = %request.image_reference,
            tracked = outcome.tracked_faces,
            new = outcome.new_faces,
            recognized = outcome.recognized_faces,
            untracked = outcome.untracked_regions,
            "analysis processed"
        );
        outcome
    }

    pub fn identity_summary(&self, identity_id: &str) -> IdentitySummary {
        let state = self.lock();
        summarize(
            identity_id,
            state.tables.identities.get(identity_id),
            state.tables.history.get(identity_id),
        )
    }

    /// Summaries of every known identity, most urgent first.
    pub fn list_identities(&self) -> Vec<IdentitySummary> {
        let state = self.lock();
        let mut ids: Vec<&String> = state.tables.identities.identities.keys().collect();
        for id in state.tables.history.entries.keys() {
            if state.tables.identities.get(id).is_none() {
                ids.push(id);
            }
        }

        let mut summaries: Vec<IdentitySummary> = ids
            .into_iter()
            .map(|id| {
                summarize(
                    id,
                    state.tables.identities.get(id),
                    state.tables.history.get(id),
                )
            })
            .collect();
        sort_by_priority(&mut summaries);
        summaries
    }

    pub fn adjustment_summary(&self, identity_id: &str) -> AdjustmentSummary {
        let state = self.lock();
        summarize_adjustments(identity_id, state.tables.history.get(identity_id))
    }

    pub fn history(&self, identity_id: &str) -> Vec<HistoryEntry> {
        self.lock().tables.history.get(identity_id).to_vec()
    }

    pub fn identity(&self, identity_id: &str) -> Option<Identity> {
        self.lock().tables.identities.get(identity_id).cloned()
    }

    pub fn statistics(&self) -> TrackerStatistics {
        let state = self.lock();
        TrackerStatistics {
            counters: state.stats.clone(),
            known_identities: state.tables.identities.len(),
            identities_with_history: state
                .tables
                .history
                .entries
                .values()
                .filter(|list| !list.is_empty())
                .count(),
            persistence: self.backend.describe(),
        }
    }

    /// Copy of the current tables.
    pub fn snapshot(&self) -> Snapshot {
        self.lock().tables.clone()
    }

    /// Write a longitudinal report for `identity_id` into `dir`.
    pub fn export_report(&self, identity_id: &str, dir: &Path) -> Result<PathBuf, TrackingError> {
        let report = {
            let state = self.lock();
            let identity = state.tables.identities.get(identity_id);
            let history = state.tables.history.get(identity_id);
            if identity.is_none() && history.is_empty() {
                return Err(TrackingError::UnknownIdentity(identity_id.to_string()));
            }
            IdentityReport::build(
                summarize(identity_id, identity, history),
                identity,
                history,
                Utc::now(),
            )
        };
        report.write_to(dir)
    }

    /// Irreversibly forget every identity and history.
    ///
    /// Returns `false` without touching anything unless `confirm` is set.
    /// The id counter survives so earlier ids are never handed out again.
    pub fn reset(&self, confirm: bool) -> bool {
        if !confirm {
            tracing::warn!("reset requested but not confirmed");
            return false;
        }

        let mut state = self.lock();
        state.tables.identities.clear();
        state.tables.history.clear();
        state.index.clear();
        state.stats = TrackingStats::default();
        self.persist_locked(&mut state);
        tracing::info!("all identity tracking data has been reset");
        true
    }

    /// Hand the current tables to the backend. Failures are counted and
    /// logged; the in-memory state stays authoritative.
    fn persist_locked(&self, state: &mut TrackerState) {
        if let Err(e) = self.backend.save(&state.tables) {
            state.stats.persistence_failures += 1;
            tracing::warn!(error = %e, backend = %self.backend.describe(), "snapshot write failed");
        }
    }
}

/// Load both tables independently and repair what can be repaired.
fn load_snapshot(backend: &dyn SnapshotBackend, config: &TrackingConfig) -> Snapshot {
    let mut identities = backend
        .load_identities()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "identity table unreadable, starting empty");
            None
        })
        .unwrap_or_default();
    let mut history = backend
        .load_history()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "history table unreadable, starting empty");
            None
        })
        .unwrap_or_default();

    let known: Vec<String> = identities
        .identities
        .keys()
        .chain(history.entries.keys())
        .cloned()
        .collect();
    for id in &known {
        identities.reserve_past(id);
    }

    for violation in history.enforce_bounds(config.max_history) {
        tracing::warn!(error = %violation, "history truncated on load");
    }
    let cutoff = config
        .retention()
        .and_then(|r| Utc::now().checked_sub_signed(r));
    if let Some(cutoff) = cutoff {
        let pruned = history.prune_before(cutoff);
        if pruned > 0 {
            tracing::info!(pruned, "expired history entries pruned on load");
        }
    }

    Snapshot {
        identities,
        history,
    }
}

/// Weight for a recognized face: grows with how often the identity was
/// seen and with its positive analyses so far.
fn recognition_boost(tables: &Snapshot, identity_id: &str) -> f32 {
    let seen = tables
        .identities
        .get(identity_id)
        .map_or(1, |identity| identity.seen_count);
    let positives = tables
        .history
        .get(identity_id)
        .iter()
        .filter(|e| e.has_positive_finding)
        .count();

    let familiarity = (1.0 + SEEN_BOOST_STEP * seen.saturating_sub(1) as f32).min(SEEN_BOOST_MAX);
    let consistency = (1.0 + POSITIVE_BOOST_STEP * positives as f32).min(POSITIVE_BOOST_MAX);
    familiarity * consistency
}

fn is_session_id(id: &str) -> bool {
    id.starts_with(SESSION_PREFIX)
}

fn session_id() -> String {
    format!("{SESSION_PREFIX}{}", uuid::Uuid::new_v4().simple())
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::history::HistoryTable;
    use crate::identity::IdentityTable;
    use crate::persist::JsonFileBackend;
    use crate::pipeline::PrecomputedDescriptors;
    use crate::types::{BoundingBox, EyeRegion, RiskLevel, Urgency};

    fn finding(region: &str, detected: bool, confidence: f32) -> Finding {
        Finding {
            region_id: region.into(),
            leukocoria_detected: detected,
            confidence,
            risk_level: if detected { RiskLevel::Medium } else { RiskLevel::Low },
            urgency: if detected { Urgency::Soon } else { Urgency::Routine },
            medical_reasoning: String::new(),
        }
    }

    fn descriptor(values: &[f32]) -> FaceDescriptor {
        FaceDescriptor::new(values.to_vec())
    }

    fn region(id: &str, kind: RegionKind) -> EyeRegion {
        EyeRegion {
            id: id.into(),
            bbox: BoundingBox::new(100.0, 120.0, 40.0, 20.0),
            kind,
            source_confidence: 0.9,
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("glint-tracker-{}", uuid::Uuid::new_v4()))
    }

    /// Seed prior history directly, `positives` of `total` positive.
    fn seed_history(tracker: &IdentityTracker, id: &str, total: usize, positives: usize) {
        let mut state = tracker.lock();
        let now = Utc::now();
        for i in 0..total {
            let positive = i < positives;
            state.tables.history.append(
                id,
                HistoryEntry {
                    timestamp: now - Duration::days((total - i) as i64),
                    image_reference: format!("prior_{i}.jpg"),
                    has_positive_finding: positive,
                    summary: AnalysisSummary {
                        regions_analyzed: 1,
                        positive_detections: u32::from(positive),
                        method: "seed".into(),
                        adjusted_regions: 0,
                    },
                },
                10,
                None,
                now,
            );
        }
    }

    #[test]
    fn test_resolve_new_then_match() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let first = tracker.resolve_identity(&descriptor(&[0.0, 0.0])).unwrap();
        assert!(first.is_new);
        assert_eq!(first.identity_id, "child_0001");
        assert_eq!(first.distance, None);

        let again = tracker.resolve_identity(&descriptor(&[0.1, 0.1])).unwrap();
        assert!(!again.is_new);
        assert_eq!(again.identity_id, "child_0001");

        let identity = tracker.identity("child_0001").unwrap();
        assert_eq!(identity.seen_count, 2);
        // Prototype is never re-averaged
        assert_eq!(identity.prototype, descriptor(&[0.0, 0.0]));
    }

    #[test]
    fn test_resolve_within_threshold_is_same_identity() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let a = tracker.resolve_identity(&descriptor(&[1.0, 1.0, 1.0])).unwrap();
        let b = tracker.resolve_identity(&descriptor(&[1.2, 1.1, 0.9])).unwrap();
        assert_eq!(a.identity_id, b.identity_id);
    }

    #[test]
    fn test_resolve_at_threshold_creates_new() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        tracker.resolve_identity(&descriptor(&[0.0])).unwrap();
        // Exactly 0.5 apart: not < 0.4
        let far = tracker.resolve_identity(&descriptor(&[0.5])).unwrap();
        assert!(far.is_new);
        assert_eq!(far.identity_id, "child_0002");
    }

    #[test]
    fn test_resolve_picks_closest() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        tracker.resolve_identity(&descriptor(&[0.0])).unwrap();
        tracker.resolve_identity(&descriptor(&[0.6])).unwrap();
        let query = tracker.resolve_identity(&descriptor(&[0.35])).unwrap();
        assert_eq!(query.identity_id, "child_0002");
        assert!((query.distance.unwrap() - 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_resolve_rejects_invalid_descriptor() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        assert!(matches!(
            tracker.resolve_identity(&descriptor(&[])),
            Err(TrackingError::InvalidDescriptor(_))
        ));
        assert!(tracker.resolve_identity(&descriptor(&[f32::NAN])).is_err());
        assert_eq!(tracker.statistics().known_identities, 0);
    }

    #[test]
    fn test_concurrent_resolve_creates_one_identity() {
        let tracker = Arc::new(IdentityTracker::in_memory(TrackingConfig::default()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let jitter = i as f32 * 0.01;
                    tracker
                        .resolve_identity(&descriptor(&[0.5 + jitter, 0.5]))
                        .unwrap()
                        .identity_id
                })
            })
            .collect();

        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| id == "child_0001"));
        let stats = tracker.statistics();
        assert_eq!(stats.known_identities, 1);
        assert_eq!(stats.counters.new_identities, 1);
        assert_eq!(stats.counters.recognitions, 7);
    }

    #[test]
    fn test_huge_day_windows_keep_everything() {
        let config = TrackingConfig {
            recent_window_days: 1_000_000_000,
            retention_days: 1_000_000_000,
            ..TrackingConfig::default()
        };
        let tracker = IdentityTracker::in_memory(config);
        let id = tracker.resolve_identity(&descriptor(&[0.3])).unwrap().identity_id;
        seed_history(&tracker, &id, 3, 2);

        let result = tracker
            .record_and_adjust(&id, finding("r", true, 55.0), "a.jpg")
            .unwrap();
        // Same outcome as the default window: every entry counts as recent
        assert!((result.adjustment_factor - 0.25).abs() < 1e-6);
        assert_eq!(tracker.history(&id).len(), 4);
    }

    #[test]
    fn test_huge_retention_on_load() {
        let backend = MemoryBackend::new();
        let mut snapshot = Snapshot::default();
        snapshot.history.append(
            "child_0001",
            HistoryEntry {
                timestamp: Utc::now() - Duration::days(3650),
                image_reference: "old.jpg".into(),
                has_positive_finding: true,
                summary: AnalysisSummary {
                    regions_analyzed: 1,
                    positive_detections: 1,
                    method: "seed".into(),
                    adjusted_regions: 0,
                },
            },
            10,
            None,
            Utc::now(),
        );
        backend.save(&snapshot).unwrap();

        let config = TrackingConfig {
            retention_days: u32::MAX,
            ..TrackingConfig::default()
        };
        let tracker = IdentityTracker::open(config, Box::new(backend));
        assert_eq!(tracker.history("child_0001").len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let id = tracker.resolve_identity(&descriptor(&[0.3])).unwrap().identity_id;
        for i in 0..15 {
            tracker
                .record_and_adjust(&id, finding("r", i % 3 == 0, 40.0), &format!("{i}.jpg"))
                .unwrap();
        }
        let history = tracker.history(&id);
        assert_eq!(history.len(), 10);
        assert_eq!(history.last().unwrap().image_reference, "14.jpg");
    }

    #[test]
    fn test_adjusted_confidence_in_range() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let id = tracker.resolve_identity(&descriptor(&[0.3])).unwrap().identity_id;
        seed_history(&tracker, &id, 5, 5);
        for confidence in [0.0, 12.5, 55.0, 95.0, 100.0, 250.0, -5.0] {
            for detected in [true, false] {
                let result = tracker
                    .record_and_adjust(&id, finding("r", detected, confidence), "x.jpg")
                    .unwrap();
                assert!((0.0..=100.0).contains(&result.finding.confidence));
            }
        }
    }

    #[test]
    fn test_summary_is_idempotent() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let id = tracker.resolve_identity(&descriptor(&[0.3])).unwrap().identity_id;
        tracker.record_and_adjust(&id, finding("r", true, 70.0), "a.jpg").unwrap();
        assert_eq!(tracker.identity_summary(&id), tracker.identity_summary(&id));
    }

    #[test]
    fn test_scenario_a_positive_history_escalates() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let id = tracker.resolve_identity(&descriptor(&[0.3])).unwrap().identity_id;
        seed_history(&tracker, &id, 3, 2);

        let result = tracker
            .record_and_adjust(&id, finding("r", true, 55.0), "a.jpg")
            .unwrap();
        assert!(result.adjustment_factor >= 0.15);
        assert!(result.finding.confidence >= 63.0);
        assert!(matches!(result.finding.risk_level, RiskLevel::Medium | RiskLevel::High));
        assert_eq!(tracker.history(&id).len(), 4);
    }

    #[test]
    fn test_scenario_b_negative_history_unchanged() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let id = tracker.resolve_identity(&descriptor(&[0.3])).unwrap().identity_id;
        seed_history(&tracker, &id, 5, 0);

        let raw = finding("r", false, 20.0);
        let result = tracker.record_and_adjust(&id, raw.clone(), "b.jpg").unwrap();
        assert_eq!(result.adjustment_factor, 0.0);
        assert_eq!(result.finding, raw);
        assert!(!result.confidence_adjusted);
    }

    #[test]
    fn test_scenario_c_false_negative_rule() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let id = tracker.resolve_identity(&descriptor(&[0.3])).unwrap().identity_id;
        seed_history(&tracker, &id, 4, 3);

        let result = tracker
            .record_and_adjust(&id, finding("r", false, 25.0), "c.jpg")
            .unwrap();
        assert!(result.adjustment_factor >= 0.20 - 1e-6);
        assert!(result
            .adjustment_reasoning
            .iter()
            .any(|r| r.contains("possible false negative")));
        if result.finding.confidence > 50.0 {
            assert!(result.detection_changed_by_history);
        }
        // The raw finding is what gets recorded
        assert!(!tracker.history(&id).last().unwrap().has_positive_finding);
    }

    #[test]
    fn test_scenario_d_new_face_passes_through() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        tracker.resolve_identity(&descriptor(&[5.0, 5.0])).unwrap();
        let resolution = tracker.resolve_identity(&descriptor(&[0.0, 0.0])).unwrap();
        assert!(resolution.is_new);
        assert_eq!(resolution.identity_id, "child_0002");
        assert!(tracker.history(&resolution.identity_id).is_empty());

        let raw = finding("r", true, 72.0);
        let result = tracker
            .record_and_adjust(&resolution.identity_id, raw.clone(), "d.jpg")
            .unwrap();
        assert_eq!(result.finding, raw);
        assert_eq!(result.adjustment_factor, 0.0);
    }

    #[test]
    fn test_record_unknown_identity() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let err = tracker
            .record_and_adjust("child_0099", finding("r", true, 50.0), "x.jpg")
            .unwrap_err();
        assert_eq!(err, TrackingError::UnknownIdentity("child_0099".into()));
    }

    #[test]
    fn test_session_identity_records_nothing() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let raw = finding("r", true, 50.0);
        let result = tracker
            .record_and_adjust("session_abc", raw.clone(), "x.jpg")
            .unwrap();
        assert_eq!(result.finding, raw);
        assert!(tracker.history("session_abc").is_empty());
    }

    #[test]
    fn test_list_identities_sorted_by_urgency() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let calm = tracker.resolve_identity(&descriptor(&[0.0])).unwrap().identity_id;
        let urgent = tracker.resolve_identity(&descriptor(&[5.0])).unwrap().identity_id;
        tracker.record_and_adjust(&calm, finding("r", false, 10.0), "1.jpg").unwrap();
        tracker.record_and_adjust(&calm, finding("r", false, 10.0), "2.jpg").unwrap();
        tracker.record_and_adjust(&urgent, finding("r", true, 80.0), "1.jpg").unwrap();
        tracker.record_and_adjust(&urgent, finding("r", true, 80.0), "2.jpg").unwrap();

        let list = tracker.list_identities();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].identity_id, urgent);
        assert_eq!(list[0].urgency, Urgency::Immediate);
        assert_eq!(list[1].identity_id, calm);
    }

    #[test]
    fn test_process_analysis_groups_regions() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let mut provider = PrecomputedDescriptors::default();
        provider.insert("left", descriptor(&[0.2, 0.2]));
        provider.insert("right", descriptor(&[0.25, 0.2]));

        let request = AnalysisRequest {
            image_reference: "family.jpg".into(),
            method: "multimodal".into(),
            regions: vec![
                region("left", RegionKind::Left),
                region("right", RegionKind::Right),
                region("blurry", RegionKind::Unknown),
            ],
            findings: vec![
                finding("right", false, 15.0),
                finding("left", true, 70.0),
                finding("blurry", true, 90.0),
            ],
        };
        let outcome = tracker.process_analysis(&provider, request);

        assert_eq!(outcome.tracked_faces, 2);
        assert_eq!(outcome.new_faces, 1);
        assert_eq!(outcome.recognized_faces, 1);
        assert_eq!(outcome.untracked_regions, 1);
        let blurry = outcome.mappings.iter().find(|m| m.region_id == "blurry").unwrap();
        assert!(!blurry.tracked);
        assert!(blurry.identity_id.starts_with("session_"));

        // Output keeps the request's finding order
        let order: Vec<&str> = outcome.findings.iter().map(|f| f.finding.region_id.as_str()).collect();
        assert_eq!(order, ["right", "left", "blurry"]);

        // Both eyes share one history entry
        let history = tracker.history("child_0001");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].summary.regions_analyzed, 2);
        assert_eq!(history[0].summary.positive_detections, 1);
        assert_eq!(history[0].summary.method, "multimodal");
        assert!(history[0].has_positive_finding);
        assert_eq!(tracker.identity("child_0001").unwrap().first_region_kind, RegionKind::Left);

        let stats = tracker.statistics();
        assert_eq!(stats.counters.untracked_regions, 1);
        assert_eq!(stats.identities_with_history, 1);
    }

    #[test]
    fn test_recognized_face_reports_boost() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let mut provider = PrecomputedDescriptors::default();
        provider.insert("left", descriptor(&[0.4, 0.1]));

        let request = |image: &str, detected: bool| AnalysisRequest {
            image_reference: image.into(),
            method: "multimodal".into(),
            regions: vec![
                region("left", RegionKind::Left),
                region("blurry", RegionKind::Unknown),
            ],
            findings: vec![finding("left", detected, 70.0)],
        };

        let first = tracker.process_analysis(&provider, request("a.jpg", true));
        assert!(first.mappings.iter().all(|m| m.confidence_boost.is_none()));

        // Seen twice with one positive analysis: 1.1 * 1.15
        let second = tracker.process_analysis(&provider, request("b.jpg", false));
        let left = second.mappings.iter().find(|m| m.region_id == "left").unwrap();
        assert!(!left.is_new);
        assert!((left.confidence_boost.unwrap() - 1.265).abs() < 1e-5);
        let blurry = second.mappings.iter().find(|m| m.region_id == "blurry").unwrap();
        assert_eq!(blurry.confidence_boost, None);
        // Informational only
        assert_eq!(second.findings[0].original_confidence, 70.0);

        // Both factors cap: 1.5 * 1.3
        for i in 0..8 {
            tracker.process_analysis(&provider, request(&format!("c{i}.jpg"), true));
        }
        let later = tracker.process_analysis(&provider, request("d.jpg", true));
        assert!((later.mappings[0].confidence_boost.unwrap() - 1.95).abs() < 1e-5);
    }

    #[test]
    fn test_persistence_roundtrip_and_counter() {
        let dir = temp_dir();
        {
            let tracker = IdentityTracker::open(
                TrackingConfig::default(),
                Box::new(JsonFileBackend::new(&dir)),
            );
            let id = tracker.resolve_identity(&descriptor(&[0.1, 0.9])).unwrap().identity_id;
            tracker.record_and_adjust(&id, finding("r", true, 60.0), "a.jpg").unwrap();
        }

        let tracker = IdentityTracker::open(
            TrackingConfig::default(),
            Box::new(JsonFileBackend::new(&dir)),
        );
        let again = tracker.resolve_identity(&descriptor(&[0.1, 0.9])).unwrap();
        assert!(!again.is_new);
        assert_eq!(tracker.history(&again.identity_id).len(), 1);

        let other = tracker.resolve_identity(&descriptor(&[9.0, 9.0])).unwrap();
        assert_eq!(other.identity_id, "child_0002");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_identity_table_keeps_counter_from_history() {
        let dir = temp_dir();
        let backend = JsonFileBackend::new(&dir);
        {
            let tracker = IdentityTracker::open(TrackingConfig::default(), Box::new(backend.clone()));
            for x in [0.0, 3.0, 6.0] {
                let id = tracker.resolve_identity(&descriptor(&[x])).unwrap().identity_id;
                tracker.record_and_adjust(&id, finding("r", false, 10.0), "a.jpg").unwrap();
            }
        }
        std::fs::write(backend.identities_path(), "{ truncated").unwrap();

        let tracker = IdentityTracker::open(TrackingConfig::default(), Box::new(backend));
        assert_eq!(tracker.statistics().known_identities, 0);
        assert_eq!(tracker.history("child_0003").len(), 1);
        let fresh = tracker.resolve_identity(&descriptor(&[0.0])).unwrap();
        assert_eq!(fresh.identity_id, "child_0004");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_truncates_oversized_history() {
        let backend = MemoryBackend::new();
        let mut snapshot = Snapshot::default();
        let now = Utc::now();
        let entries = (0..14)
            .map(|i| HistoryEntry {
                timestamp: now - Duration::hours(i),
                image_reference: format!("{i}.jpg"),
                has_positive_finding: false,
                summary: AnalysisSummary {
                    regions_analyzed: 1,
                    positive_detections: 0,
                    method: "seed".into(),
                    adjusted_regions: 0,
                },
            })
            .collect();
        snapshot.history.entries.insert("child_0007".into(), entries);
        backend.save(&snapshot).unwrap();

        let tracker = IdentityTracker::open(TrackingConfig::default(), Box::new(backend));
        assert_eq!(tracker.history("child_0007").len(), 10);
        assert_eq!(
            tracker.resolve_identity(&descriptor(&[1.0])).unwrap().identity_id,
            "child_0008"
        );
    }

    #[test]
    fn test_reset_requires_confirmation() {
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let id = tracker.resolve_identity(&descriptor(&[0.0])).unwrap().identity_id;
        tracker.record_and_adjust(&id, finding("r", true, 80.0), "a.jpg").unwrap();

        assert!(!tracker.reset(false));
        assert_eq!(tracker.statistics().known_identities, 1);

        assert!(tracker.reset(true));
        let stats = tracker.statistics();
        assert_eq!(stats.known_identities, 0);
        assert_eq!(stats.counters, TrackingStats::default());
        assert!(tracker.history(&id).is_empty());
        // Ids are not reused after a reset
        let next = tracker.resolve_identity(&descriptor(&[0.0])).unwrap();
        assert_eq!(next.identity_id, "child_0002");
    }

    #[test]
    fn test_export_report() {
        let dir = temp_dir();
        let tracker = IdentityTracker::in_memory(TrackingConfig::default());
        let id = tracker.resolve_identity(&descriptor(&[0.4, 0.4])).unwrap().identity_id;
        tracker.record_and_adjust(&id, finding("r", true, 80.0), "a.jpg").unwrap();

        let path = tracker.export_report(&id, &dir).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("identity_report_child_0001_"));

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(report["report_info"]["identity_id"], "child_0001");
        assert_eq!(report["identity"]["descriptor_dim"], 2);
        assert!(report["identity"].get("prototype").is_none());
        assert_eq!(report["detailed_history"].as_array().unwrap().len(), 1);

        assert!(matches!(
            tracker.export_report("child_0042", &dir),
            Err(TrackingError::UnknownIdentity(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    struct FailingBackend;

    impl SnapshotBackend for FailingBackend {
        fn load_identities(&self) -> Result<Option<IdentityTable>, TrackingError> {
            Err(TrackingError::corrupt("identity", "disk on fire"))
        }
        fn load_history(&self) -> Result<Option<HistoryTable>, TrackingError> {
            Ok(None)
        }
        fn save(&self, _snapshot: &Snapshot) -> Result<(), TrackingError> {
            Err(TrackingError::PersistenceWriteFailed("read-only".into()))
        }
        fn describe(&self) -> String {
            "failing".into()
        }
    }

    #[test]
    fn test_write_failure_keeps_memory_state() {
        let tracker = IdentityTracker::open(TrackingConfig::default(), Box::new(FailingBackend));
        let id = tracker.resolve_identity(&descriptor(&[0.0])).unwrap().identity_id;
        tracker.record_and_adjust(&id, finding("r", true, 80.0), "a.jpg").unwrap();

        assert_eq!(tracker.history(&id).len(), 1);
        let stats = tracker.statistics();
        assert_eq!(stats.counters.persistence_failures, 2);
        assert_eq!(stats.persistence, "failing");
    }
}
