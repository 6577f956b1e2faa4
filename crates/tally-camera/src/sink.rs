use std::path::PathBuf;
use tokio::sync::mpsc;

/// Receiver of captured snapshot files.
///
/// `submit` must not block; implementations queue or spawn the work.
pub trait SnapshotSink: Send + Sync {
    fn submit(&self, path: PathBuf);
}

impl SnapshotSink for mpsc::UnboundedSender<PathBuf> {
    fn submit(&self, path: PathBuf) {
        if let Err(e) = self.send(path) {
            tracing::warn!(path = %e.0.display(), "snapshot receiver closed; dropping snapshot");
        }
    }
}
