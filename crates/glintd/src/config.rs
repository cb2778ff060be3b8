use std::path::{Path, PathBuf};

use anyhow::Context;
use glint_core::TrackingConfig;
use serde::Deserialize;

/// Where snapshots are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Json,
    Sqlite,
    Memory,
}

impl BackendKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "sqlite" => Some(Self::Sqlite),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Optional TOML file named by `GLINT_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    tracking: TrackingConfig,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding snapshots, the database and its key.
    pub data_dir: PathBuf,
    /// Directory exported reports are written to.
    pub reports_dir: PathBuf,
    pub backend: BackendKind,
    /// When false, state lives in memory only regardless of `backend`.
    pub persistence_enabled: bool,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
    pub tracking: TrackingConfig,
}

impl Config {
    /// Load configuration from `GLINT_*` environment variables with defaults,
    /// layered over the `[tracking]` table of `GLINT_CONFIG` if set.
    pub fn from_env() -> anyhow::Result<Self> {
        let file = match std::env::var("GLINT_CONFIG") {
            Ok(path) => load_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };

        let data_dir = std::env::var("GLINT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("glint")
            });

        let reports_dir = std::env::var("GLINT_REPORTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("reports"));

        let backend = match std::env::var("GLINT_BACKEND") {
            Ok(value) => BackendKind::parse(&value).with_context(|| {
                format!("GLINT_BACKEND must be json, sqlite or memory (got {value:?})")
            })?,
            Err(_) => BackendKind::Json,
        };

        let defaults = file.tracking;
        let tracking = TrackingConfig {
            similarity_threshold: env_f32(
                "GLINT_SIMILARITY_THRESHOLD",
                defaults.similarity_threshold,
            ),
            max_history: env_usize("GLINT_MAX_HISTORY", defaults.max_history),
            recent_window_days: env_u32("GLINT_RECENT_WINDOW_DAYS", defaults.recent_window_days),
            min_recent_entries: env_usize("GLINT_MIN_RECENT_ENTRIES", defaults.min_recent_entries),
            retention_days: env_u32("GLINT_RETENTION_DAYS", defaults.retention_days),
        };

        Ok(Self {
            data_dir,
            reports_dir,
            backend,
            persistence_enabled: env_flag("GLINT_PERSISTENCE_ENABLED", true),
            session_bus: env_flag("GLINT_SESSION_BUS", false),
            tracking,
        })
    }

    /// Path of the SQLite database inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("glint.db")
    }
}

fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    parse_file(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

fn parse_file(raw: &str) -> Result<FileConfig, toml::de::Error> {
    toml::from_str(raw)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
