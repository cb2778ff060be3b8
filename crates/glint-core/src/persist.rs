//! Snapshot persistence for the identity and history tables.
//!
//! Both tables are written in full after each completed analysis and load
//! independently: a missing or corrupt table comes back as empty without
//! affecting the other one.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};

use crate::error::TrackingError;
use crate::history::HistoryTable;
use crate::identity::IdentityTable;

/// Schema version written by this build.
pub const FORMAT_VERSION: u32 = 1;

const IDENTITIES_FORMAT: &str = "glint.identities";
const HISTORY_FORMAT: &str = "glint.history";
const IDENTITIES_FILE: &str = "identities.json";
const HISTORY_FILE: &str = "history.json";

/// Full state of the tracker at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub identities: IdentityTable,
    pub history: HistoryTable,
}

/// Durable storage for snapshots.
///
/// `Ok(None)` from a load means the table does not exist yet.
pub trait SnapshotBackend: Send + Sync {
    fn load_identities(&self) -> Result<Option<IdentityTable>, TrackingError>;
    fn load_history(&self) -> Result<Option<HistoryTable>, TrackingError>;
    fn save(&self, snapshot: &Snapshot) -> Result<(), TrackingError>;
    /// Human-readable location, for logs and status output.
    fn describe(&self) -> String;
}

/// Keeps the last snapshot in memory only.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    last: Mutex<Option<Snapshot>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently saved snapshot.
    pub fn last_snapshot(&self) -> Option<Snapshot> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SnapshotBackend for MemoryBackend {
    fn load_identities(&self) -> Result<Option<IdentityTable>, TrackingError> {
        Ok(self.last_snapshot().map(|s| s.identities))
    }

    fn load_history(&self) -> Result<Option<HistoryTable>, TrackingError> {
        Ok(self.last_snapshot().map(|s| s.history))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), TrackingError> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Versioned record wrapping one table on disk.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: String,
    version: u32,
    saved_at: DateTime<Utc>,
    /// SHA-256 of the payload text exactly as stored, hex encoded.
    checksum: String,
    payload: Box<RawValue>,
}

/// Two JSON files (`identities.json`, `history.json`) in one directory.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    dir: PathBuf,
}

impl JsonFileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn identities_path(&self) -> PathBuf {
        self.dir.join(IDENTITIES_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }
}

impl SnapshotBackend for JsonFileBackend {
    fn load_identities(&self) -> Result<Option<IdentityTable>, TrackingError> {
        read_table(&self.identities_path(), IDENTITIES_FORMAT, "identity")
    }

    fn load_history(&self) -> Result<Option<HistoryTable>, TrackingError> {
        read_table(&self.history_path(), HISTORY_FORMAT, "history")
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), TrackingError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            TrackingError::PersistenceWriteFailed(format!("{}: {e}", self.dir.display()))
        })?;
        write_table(&self.identities_path(), IDENTITIES_FORMAT, &snapshot.identities)?;
        write_table(&self.history_path(), HISTORY_FORMAT, &snapshot.history)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.dir.display())
    }
}

fn checksum(canonical: &str) -> String {
    Sha256::digest(canonical.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn write_table<T: Serialize>(path: &Path, format: &str, table: &T) -> Result<(), TrackingError> {
    let write_err = |e: &dyn std::fmt::Display| {
        TrackingError::PersistenceWriteFailed(format!("{}: {e}", path.display()))
    };

    let text = serde_json::to_string(table).map_err(|e| write_err(&e))?;
    let envelope = Envelope {
        format: format.to_string(),
        version: FORMAT_VERSION,
        saved_at: Utc::now(),
        checksum: checksum(&text),
        payload: RawValue::from_string(text).map_err(|e| write_err(&e))?,
    };
    let bytes = serde_json::to_vec_pretty(&envelope).map_err(|e| write_err(&e))?;

    // Write-then-rename so a crash never leaves a half-written table.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(|e| write_err(&e))?;
    std::fs::rename(&tmp, path).map_err(|e| write_err(&e))?;
    Ok(())
}

fn read_table<T: DeserializeOwned>(
    path: &Path,
    format: &str,
    table: &'static str,
) -> Result<Option<T>, TrackingError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TrackingError::corrupt(table, e)),
    };

    let envelope: Envelope =
        serde_json::from_str(&raw).map_err(|e| TrackingError::corrupt(table, e))?;

    if envelope.format != format {
        return Err(TrackingError::corrupt(
            table,
            format!("unexpected format {:?}", envelope.format),
        ));
    }
    if envelope.version > FORMAT_VERSION {
        tracing::warn!(
            path = %path.display(),
            version = envelope.version,
            supported = FORMAT_VERSION,
            "snapshot written by a newer version; reading known fields only"
        );
    }

    let text = envelope.payload.get();
    if checksum(text) != envelope.checksum {
        return Err(TrackingError::corrupt(table, "checksum mismatch"));
    }

    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| TrackingError::corrupt(table, e))
}
