use std::path::PathBuf;
use std::sync::Arc;

use glint_core::{
    AnalysisRequest, FaceDescriptor, Finding, IdentityTracker, PrecomputedDescriptors,
    TrackingError,
};
use serde::Deserialize;
use zbus::interface;

pub const BUS_NAME: &str = "org.glint.Tracker1";
pub const OBJECT_PATH: &str = "/org/glint/Tracker1";

/// `ProcessAnalysis` payload: the analysis request plus descriptors the
/// caller already extracted, keyed by region id.
#[derive(Debug, Deserialize)]
struct AnalysisPayload {
    #[serde(flatten)]
    request: AnalysisRequest,
    #[serde(default)]
    descriptors: PrecomputedDescriptors,
}

/// D-Bus interface for the Glint identity tracker.
///
/// Bus name: org.glint.Tracker1
/// Object path: /org/glint/Tracker1
///
/// Structured payloads travel as JSON strings. Tracker calls take a
/// blocking lock and may touch disk, so they run on the blocking pool.
pub struct TrackerService {
    tracker: Arc<IdentityTracker>,
    reports_dir: PathBuf,
    persistence_enabled: bool,
}

impl TrackerService {
    pub fn new(tracker: Arc<IdentityTracker>, reports_dir: PathBuf, persistence_enabled: bool) -> Self {
        Self {
            tracker,
            reports_dir,
            persistence_enabled,
        }
    }

    async fn run<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&IdentityTracker) -> T + Send + 'static,
    {
        let tracker = Arc::clone(&self.tracker);
        tokio::task::spawn_blocking(move || f(&tracker))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("tracker task failed: {e}")))
    }
}

#[interface(name = "org.glint.Tracker1")]
impl TrackerService {
    /// Match a descriptor (JSON array of numbers) to an identity.
    async fn resolve_identity(&self, descriptor_json: &str) -> zbus::fdo::Result<(String, bool)> {
        let descriptor: FaceDescriptor = parse_json(descriptor_json)?;
        let resolution = self
            .run(move |t| t.resolve_identity(&descriptor))
            .await?
            .map_err(to_fdo)?;
        tracing::info!(
            identity = %resolution.identity_id,
            is_new = resolution.is_new,
            "resolve_identity"
        );
        Ok((resolution.identity_id, resolution.is_new))
    }

    /// Adjust one finding against history and record it.
    async fn record_and_adjust(
        &self,
        identity_id: &str,
        finding_json: &str,
        image_reference: &str,
    ) -> zbus::fdo::Result<String> {
        let finding: Finding = parse_json(finding_json)?;
        let id = identity_id.to_string();
        let image = image_reference.to_string();
        let adjusted = self
            .run(move |t| t.record_and_adjust(&id, finding, &image))
            .await?
            .map_err(to_fdo)?;
        to_json(&adjusted)
    }

    /// Run the full per-image pipeline.
    async fn process_analysis(&self, request_json: &str) -> zbus::fdo::Result<String> {
        let payload: AnalysisPayload = parse_json(request_json)?;
        let outcome = self
            .run(move |t| t.process_analysis(&payload.descriptors, payload.request))
            .await?;
        to_json(&outcome)
    }

    async fn identity_summary(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        let id = identity_id.to_string();
        let summary = self.run(move |t| t.identity_summary(&id)).await?;
        to_json(&summary)
    }

    /// All identities, most urgent first.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let summaries = self.run(|t| t.list_identities()).await?;
        to_json(&summaries)
    }

    async fn adjustment_summary(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        let id = identity_id.to_string();
        let summary = self.run(move |t| t.adjustment_summary(&id)).await?;
        to_json(&summary)
    }

    async fn statistics(&self) -> zbus::fdo::Result<String> {
        let stats = self.run(|t| t.statistics()).await?;
        to_json(&stats)
    }

    /// Export a longitudinal report; returns the written file path.
    async fn export_report(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        let id = identity_id.to_string();
        let dir = self.reports_dir.clone();
        let path = self
            .run(move |t| t.export_report(&id, &dir))
            .await?
            .map_err(to_fdo)?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Forget all identities and history. Does nothing unless `confirm`.
    async fn reset(&self, confirm: bool) -> zbus::fdo::Result<bool> {
        tracing::info!(confirm, "reset requested");
        self.run(move |t| t.reset(confirm)).await
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let stats = self.run(|t| t.statistics()).await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "known_identities": stats.known_identities,
            "identities_with_history": stats.identities_with_history,
            "persistence": stats.persistence,
            "persistence_enabled": self.persistence_enabled,
            "reports_dir": self.reports_dir.display().to_string(),
        })
        .to_string())
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> zbus::fdo::Result<T> {
    serde_json::from_str(raw).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(e: TrackingError) -> zbus::fdo::Error {
    match e {
        TrackingError::UnknownIdentity(_) => zbus::fdo::Error::UnknownObject(e.to_string()),
        TrackingError::InvalidDescriptor(_) | TrackingError::DescriptorUnavailable { .. } => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        _ => zbus::fdo::Error::Failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glint_core::TrackingConfig;

    fn service() -> TrackerService {
        TrackerService::new(
            Arc::new(IdentityTracker::in_memory(TrackingConfig::default())),
            std::env::temp_dir().join(format!("glint-reports-{}", uuid::Uuid::new_v4())),
            false,
        )
    }

    #[tokio::test]
    async fn test_resolve_and_record() {
        let service = service();
        let (id, is_new) = service.resolve_identity("[0.1, 0.2, 0.3]").await.unwrap();
        assert_eq!(id, "child_0001");
        assert!(is_new);

        let finding = r#"{"region_id":"r1","leukocoria_detected":true,"confidence":72.0,
                          "risk_level":"medium","urgency":"urgent"}"#;
        let adjusted = service.record_and_adjust(&id, finding, "a.jpg").await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&adjusted).unwrap();
        assert_eq!(value["region_id"], "r1");
        assert_eq!(value["adjustment_factor"], 0.0);
    }

    #[tokio::test]
    async fn test_invalid_payloads() {
        let service = service();
        assert!(matches!(
            service.resolve_identity("not json").await,
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
        assert!(matches!(
            service.resolve_identity("[]").await,
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
        let finding = r#"{"region_id":"r1","leukocoria_detected":false,"confidence":5.0,
                          "risk_level":"low","urgency":"routine"}"#;
        assert!(matches!(
            service.record_and_adjust("child_0404", finding, "a.jpg").await,
            Err(zbus::fdo::Error::UnknownObject(_))
        ));
    }

    #[tokio::test]
    async fn test_process_analysis_payload() {
        let service = service();
        let request = r#"{
            "image_reference": "family.jpg",
            "regions": [
                {"id": "left", "bbox": {"x": 10, "y": 20, "width": 30, "height": 15}, "type": "left"},
                {"id": "right", "bbox": {"x": 60, "y": 20, "width": 30, "height": 15}, "type": "right"}
            ],
            "findings": [
                {"region_id": "left", "leukocoria_detected": true, "confidence": 81.0,
                 "risk_level": "high", "urgency": "immediate"}
            ],
            "descriptors": {"left": [0.5, 0.5]}
        }"#;
        let outcome: serde_json::Value =
            serde_json::from_str(&service.process_analysis(request).await.unwrap()).unwrap();
        assert_eq!(outcome["tracked_faces"], 1);
        assert_eq!(outcome["untracked_regions"], 1);
        assert_eq!(outcome["findings"].as_array().unwrap().len(), 1);

        let list: serde_json::Value =
            serde_json::from_str(&service.list_identities().await.unwrap()).unwrap();
        assert_eq!(list[0]["identity_id"], "child_0001");
    }

    #[tokio::test]
    async fn test_reset_needs_confirm() {
        let service = service();
        service.resolve_identity("[1.0]").await.unwrap();
        assert!(!service.reset(false).await.unwrap());
        assert!(service.reset(true).await.unwrap());
        let status: serde_json::Value =
            serde_json::from_str(&service.status().await.unwrap()).unwrap();
        assert_eq!(status["known_identities"], 0);
    }
}
