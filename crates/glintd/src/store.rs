use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use glint_core::history::{AnalysisSummary, HistoryEntry, HistoryTable};
use glint_core::identity::{Identity, IdentityTable};
use glint_core::{FaceDescriptor, RegionKind, Snapshot, SnapshotBackend, TrackingError};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const SCHEMA_VERSION: u32 = 1;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob: {0} bytes")]
    InvalidBlob(usize),
    #[error("descriptor for {id} has {actual} values, expected {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
    #[error("could not move {} aside: {source}", .path.display())]
    SetAside {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// SQLite-backed snapshot storage.
///
/// Prototype descriptors are biometric data and are encrypted with
/// AES-256-GCM before they touch disk. A per-installation 32-byte key is
/// generated at first use and stored at `{db_dir}/.key` (mode 0600).
pub struct SqliteStore {
    conn: Mutex<Connection>,
    enc_key: [u8; 32],
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations.
    ///
    /// A key file or database that cannot be used is moved aside as
    /// `<name>.corrupt-<timestamp>` and replaced with a fresh one. A new key
    /// leaves stored descriptors undecryptable, so the identity table then
    /// loads as corrupt while history survives.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key
            return Self::with_key(db_path, [0u8; 32]);
        }

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::KeyIo)?;
        }
        let key_path = db_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(".key");
        let enc_key = match load_or_generate_key(&key_path) {
            Ok(key) => key,
            Err(e) => {
                let moved = set_aside(&key_path)?;
                tracing::warn!(
                    error = %e,
                    moved_to = %moved.display(),
                    "encryption key unusable, generating a new one"
                );
                load_or_generate_key(&key_path)?
            }
        };

        match Self::with_key(db_path, enc_key) {
            Ok(store) => Ok(store),
            Err(e) => {
                let moved = set_aside(db_path)?;
                for suffix in ["-wal", "-shm"] {
                    let sidecar = with_suffix(db_path, suffix);
                    if sidecar.exists() {
                        std::fs::rename(&sidecar, with_suffix(&moved, suffix)).map_err(
                            |source| StoreError::SetAside {
                                path: sidecar.clone(),
                                source,
                            },
                        )?;
                    }
                }
                tracing::warn!(
                    error = %e,
                    moved_to = %moved.display(),
                    "database unreadable, starting with an empty one"
                );
                Self::with_key(db_path, enc_key)
            }
        }
    }

    /// Open with an explicit key instead of the key file.
    pub fn with_key(db_path: &Path, enc_key: [u8; 32]) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS meta (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS identities (
                 id TEXT PRIMARY KEY,
                 descriptor BLOB NOT NULL,
                 dim INTEGER NOT NULL,
                 first_seen TEXT NOT NULL,
                 last_seen TEXT NOT NULL,
                 seen_count INTEGER NOT NULL,
                 first_region_kind TEXT NOT NULL DEFAULT 'unknown'
             );
             CREATE TABLE IF NOT EXISTS history (
                 identity_id TEXT NOT NULL,
                 seq INTEGER NOT NULL,
                 timestamp TEXT NOT NULL,
                 image_reference TEXT NOT NULL,
                 has_positive_finding INTEGER NOT NULL,
                 regions_analyzed INTEGER NOT NULL,
                 positive_detections INTEGER NOT NULL,
                 method TEXT NOT NULL DEFAULT 'unknown',
                 adjusted_regions INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (identity_id, seq)
             );",
        )?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match stored.and_then(|v| v.parse::<u32>().ok()) {
            Some(version) if version > SCHEMA_VERSION => tracing::warn!(
                version,
                supported = SCHEMA_VERSION,
                "database written by a newer version; reading known columns only"
            ),
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            enc_key,
            path: db_path.to_path_buf(),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Counter value written by the last save, or `None` if never saved.
    fn saved_next_id(&self) -> Result<Option<u64>, StoreError> {
        let value: Option<String> = self
            .conn()
            .query_row("SELECT value FROM meta WHERE key = 'next_id'", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    fn read_identities(&self) -> Result<Option<IdentityTable>, StoreError> {
        let Some(next_id) = self.saved_next_id()? else {
            return Ok(None);
        };

        type Row = (String, Vec<u8>, i64, String, String, i64, String);
        let rows: Vec<Row> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, descriptor, dim, first_seen, last_seen, seen_count, first_region_kind
                 FROM identities ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        // Decrypt outside the connection lock
        let mut table = IdentityTable {
            next_id,
            ..IdentityTable::default()
        };
        for (id, blob, dim, first_seen, last_seen, seen_count, kind) in rows {
            let values = self.decrypt_descriptor(&blob)?;
            let expected = usize::try_from(dim).unwrap_or(0);
            if values.len() != expected {
                return Err(StoreError::DimensionMismatch {
                    id,
                    expected,
                    actual: values.len(),
                });
            }
            table.identities.insert(
                id.clone(),
                Identity {
                    id,
                    prototype: FaceDescriptor::new(values),
                    first_seen: parse_timestamp(&first_seen)?,
                    last_seen: parse_timestamp(&last_seen)?,
                    seen_count: u32::try_from(seen_count).unwrap_or(u32::MAX),
                    first_region_kind: parse_kind(&kind),
                },
            );
        }
        Ok(Some(table))
    }

    fn read_history(&self) -> Result<Option<HistoryTable>, StoreError> {
        if self.saved_next_id()?.is_none() {
            return Ok(None);
        }

        type Row = (String, String, String, bool, i64, i64, String, i64);
        let rows: Vec<Row> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT identity_id, timestamp, image_reference, has_positive_finding,
                        regions_analyzed, positive_detections, method, adjusted_regions
                 FROM history ORDER BY identity_id, seq",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut table = HistoryTable::default();
        for (id, timestamp, image_reference, positive, regions, positives, method, adjusted) in
            rows
        {
            table.entries.entry(id).or_default().push(HistoryEntry {
                timestamp: parse_timestamp(&timestamp)?,
                image_reference,
                has_positive_finding: positive,
                summary: AnalysisSummary {
                    regions_analyzed: to_u32(regions),
                    positive_detections: to_u32(positives),
                    method,
                    adjusted_regions: to_u32(adjusted),
                },
            });
        }
        Ok(Some(table))
    }

    /// Replace both tables in one transaction.
    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        // Encrypt before taking the connection lock
        let mut encrypted = Vec::with_capacity(snapshot.identities.len());
        for identity in snapshot.identities.identities.values() {
            encrypted.push((identity, self.encrypt_descriptor(&identity.prototype.values)?));
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM identities", [])?;
        tx.execute("DELETE FROM history", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO identities
                     (id, descriptor, dim, first_seen, last_seen, seen_count, first_region_kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (identity, blob) in &encrypted {
                insert.execute(params![
                    identity.id,
                    blob,
                    identity.prototype.dim() as i64,
                    identity.first_seen.to_rfc3339(),
                    identity.last_seen.to_rfc3339(),
                    i64::from(identity.seen_count),
                    kind_label(identity.first_region_kind),
                ])?;
            }

            let mut insert = tx.prepare(
                "INSERT INTO history
                     (identity_id, seq, timestamp, image_reference, has_positive_finding,
                      regions_analyzed, positive_detections, method, adjusted_regions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (id, entries) in &snapshot.history.entries {
                for (seq, entry) in entries.iter().enumerate() {
                    insert.execute(params![
                        id,
                        seq as i64,
                        entry.timestamp.to_rfc3339(),
                        entry.image_reference,
                        entry.has_positive_finding,
                        i64::from(entry.summary.regions_analyzed),
                        i64::from(entry.summary.positive_detections),
                        entry.summary.method,
                        i64::from(entry.summary.adjusted_regions),
                    ])?;
                }
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('next_id', ?1)",
            [snapshot.identities.next_id.to_string()],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('saved_at', ?1)",
            [Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Encrypt a descriptor: 12-byte random nonce followed by ciphertext + GCM tag.
    fn encrypt_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        let plaintext = descriptor_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_descriptor(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_descriptor(&plaintext)
    }
}

impl SnapshotBackend for SqliteStore {
    fn load_identities(&self) -> Result<Option<IdentityTable>, TrackingError> {
        self.read_identities()
            .map_err(|e| TrackingError::corrupt("identity", e))
    }

    fn load_history(&self) -> Result<Option<HistoryTable>, TrackingError> {
        self.read_history()
            .map_err(|e| TrackingError::corrupt("history", e))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), TrackingError> {
        self.write_snapshot(snapshot)
            .map_err(|e| TrackingError::PersistenceWriteFailed(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

/// Rename an unusable file to `<name>.corrupt-<timestamp>`.
fn set_aside(path: &Path) -> Result<PathBuf, StoreError> {
    let target = with_suffix(
        path,
        &format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S")),
    );
    std::fs::rename(path, &target).map_err(|source| StoreError::SetAside {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(target)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn descriptor_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_descriptor(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))
}

fn kind_label(kind: RegionKind) -> &'static str {
    match kind {
        RegionKind::Left => "left",
        RegionKind::Right => "right",
        RegionKind::Center => "center",
        RegionKind::Unknown => "unknown",
    }
}

fn parse_kind(label: &str) -> RegionKind {
    match label {
        "left" => RegionKind::Left,
        "right" => RegionKind::Right,
        "center" => RegionKind::Center,
        _ => RegionKind::Unknown,
    }
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
