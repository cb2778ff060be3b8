use std::sync::Arc;

use anyhow::{Context, Result};
use glint_core::{IdentityTracker, JsonFileBackend, MemoryBackend, SnapshotBackend};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::{BackendKind, Config};
use dbus_interface::{TrackerService, BUS_NAME, OBJECT_PATH};
use engine::{BackgroundWriter, WriterHandle};
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("glintd starting");

    let config = Config::from_env()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        backend = ?config.backend,
        persistence = config.persistence_enabled,
        similarity_threshold = config.tracking.similarity_threshold,
        max_history = config.tracking.max_history,
        "configuration loaded"
    );

    let (backend, writer) = open_backend(&config)?;
    let tracker = Arc::new(IdentityTracker::open(config.tracking.clone(), backend));

    let service = TrackerService::new(
        tracker,
        config.reports_dir.clone(),
        config.persistence_enabled,
    );
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "glintd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("glintd shutting down");

    if let Some(writer) = writer {
        writer.flush().await?;
        tracing::info!("pending snapshot flushed");
    }

    Ok(())
}

/// Build the snapshot backend selected by the configuration. Durable
/// backends are wrapped in the background writer.
fn open_backend(config: &Config) -> Result<(Box<dyn SnapshotBackend>, Option<WriterHandle>)> {
    if !config.persistence_enabled || config.backend == BackendKind::Memory {
        return Ok((Box::new(MemoryBackend::new()), None));
    }

    let inner: Arc<dyn SnapshotBackend> = match config.backend {
        BackendKind::Sqlite => Arc::new(
            SqliteStore::open(&config.db_path())
                .with_context(|| format!("opening {}", config.db_path().display()))?,
        ),
        BackendKind::Json | BackendKind::Memory => {
            Arc::new(JsonFileBackend::new(config.data_dir.clone()))
        }
    };

    let writer = BackgroundWriter::spawn(inner);
    let handle = writer.handle();
    Ok((Box::new(writer), Some(handle)))
}
