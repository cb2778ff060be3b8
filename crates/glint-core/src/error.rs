use thiserror::Error;

/// Failures raised by the tracking core.
///
/// Every variant is recoverable: callers degrade (skip tracking, skip
/// adjustment) instead of aborting the screening pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackingError {
    #[error("descriptor unavailable for region {region_id}: {reason}")]
    DescriptorUnavailable { region_id: String, reason: String },
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("snapshot write failed: {0}")]
    PersistenceWriteFailed(String),
    #[error("{table} table is corrupt: {reason}")]
    PersistenceLoadCorrupt { table: &'static str, reason: String },
    #[error("history for {identity} holds {len} entries (max {max})")]
    HistoryBoundsViolation {
        identity: String,
        len: usize,
        max: usize,
    },
    #[error("report export failed: {0}")]
    Report(String),
}

impl TrackingError {
    /// Shorthand for a corrupt-table error.
    pub fn corrupt(table: &'static str, reason: impl ToString) -> Self {
        Self::PersistenceLoadCorrupt {
            table,
            reason: reason.to_string(),
        }
    }
}
