use std::sync::Arc;

use glint_core::history::HistoryTable;
use glint_core::identity::IdentityTable;
use glint_core::{Snapshot, SnapshotBackend, TrackingError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("snapshot writer thread exited")]
    ChannelClosed,
}

/// Messages sent from the tracker to the writer thread.
enum WriterRequest {
    Save(Snapshot),
    Flush(oneshot::Sender<()>),
}

/// Clone-safe handle used to flush the writer thread.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriterRequest>,
}

impl WriterHandle {
    /// Wait until every snapshot queued before this call has been written.
    pub async fn flush(&self) -> Result<(), WriterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriterRequest::Flush(reply_tx))
            .map_err(|_| WriterError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WriterError::ChannelClosed)
    }
}

/// Fire-and-forget snapshot persistence.
///
/// `save` only enqueues; a dedicated OS thread performs the write on the
/// wrapped backend. When several snapshots are queued only the latest is
/// written, since each one supersedes the previous. Loads go straight to
/// the wrapped backend.
pub struct BackgroundWriter {
    inner: Arc<dyn SnapshotBackend>,
    tx: mpsc::UnboundedSender<WriterRequest>,
}

impl BackgroundWriter {
    /// Spawn the writer thread for `inner`.
    pub fn spawn(inner: Arc<dyn SnapshotBackend>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::clone(&inner);

        // On failure the receiver is dropped, so every later save reports
        // ChannelClosed.
        if let Err(e) = std::thread::Builder::new()
            .name("glint-writer".into())
            .spawn(move || writer_loop(backend, rx))
        {
            tracing::error!(error = %e, "failed to spawn snapshot writer thread");
        }

        Self { inner, tx }
    }

    pub fn handle(&self) -> WriterHandle {
        WriterHandle {
            tx: self.tx.clone(),
        }
    }
}

impl SnapshotBackend for BackgroundWriter {
    fn load_identities(&self) -> Result<Option<IdentityTable>, TrackingError> {
        self.inner.load_identities()
    }

    fn load_history(&self) -> Result<Option<HistoryTable>, TrackingError> {
        self.inner.load_history()
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), TrackingError> {
        self.tx
            .send(WriterRequest::Save(snapshot.clone()))
            .map_err(|_| TrackingError::PersistenceWriteFailed(WriterError::ChannelClosed.to_string()))
    }

    fn describe(&self) -> String {
        format!("{} (background)", self.inner.describe())
    }
}

fn writer_loop(backend: Arc<dyn SnapshotBackend>, mut rx: mpsc::UnboundedReceiver<WriterRequest>) {
    tracing::debug!(backend = %backend.describe(), "snapshot writer started");

    while let Some(request) = rx.blocking_recv() {
        let mut latest = None;
        let mut waiters = Vec::new();
        match request {
            WriterRequest::Save(snapshot) => latest = Some(snapshot),
            WriterRequest::Flush(reply) => waiters.push(reply),
        }

        // Drain whatever else is queued; only the newest snapshot matters.
        while let Ok(request) = rx.try_recv() {
            match request {
                WriterRequest::Save(snapshot) => latest = Some(snapshot),
                WriterRequest::Flush(reply) => waiters.push(reply),
            }
        }

        if let Some(snapshot) = latest {
            match backend.save(&snapshot) {
                Ok(()) => tracing::debug!(
                    identities = snapshot.identities.len(),
                    histories = snapshot.history.len(),
                    "snapshot written"
                ),
                Err(e) => tracing::warn!(error = %e, "snapshot write failed"),
            }
        }

        for reply in waiters {
            let _ = reply.send(());
        }
    }

    tracing::debug!("snapshot writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use glint_core::{FaceDescriptor, MemoryBackend, RegionKind};

    fn snapshot_with(n: usize) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for i in 0..n {
            snapshot.identities.create(
                FaceDescriptor::new(vec![i as f32]),
                RegionKind::Unknown,
                chrono::Utc::now(),
            );
        }
        snapshot
    }

    #[tokio::test]
    async fn test_flush_writes_latest_snapshot() {
        let inner = Arc::new(MemoryBackend::new());
        let writer = BackgroundWriter::spawn(inner.clone());

        for n in 1..=5 {
            writer.save(&snapshot_with(n)).unwrap();
        }
        writer.handle().flush().await.unwrap();

        let saved = inner.last_snapshot().unwrap();
        assert_eq!(saved.identities.len(), 5);
    }

    #[tokio::test]
    async fn test_loads_bypass_queue() {
        let inner = Arc::new(MemoryBackend::new());
        inner.save(&snapshot_with(2)).unwrap();
        let writer = BackgroundWriter::spawn(inner);

        assert_eq!(writer.load_identities().unwrap().unwrap().len(), 2);
        assert!(writer.describe().ends_with("(background)"));
    }

    #[tokio::test]
    async fn test_flush_with_nothing_queued() {
        let writer = BackgroundWriter::spawn(Arc::new(MemoryBackend::new()));
        writer.handle().flush().await.unwrap();
    }
}
