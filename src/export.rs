use crate::csv_codec;
use crate::error::{ImportError, Result};
use crate::store::AggregateStore;
use crate::types::TickerPostPair;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Fixed export name; each export overwrites the previous file.
pub const EXPORT_FILENAME: &str = "twitter_tickers_cache.csv";

/// Somewhere a finished CSV can be dropped. Both calls block.
pub trait ArtifactSink: Send + Sync {
    fn write(&self, filename: &str, contents: &str) -> Result<PathBuf>;

    /// A previously written artifact, or `None` if there is none.
    fn read(&self, filename: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }
}

impl ArtifactSink for DirectorySink {
    fn write(&self, filename: &str, contents: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(filename);
        let tmp = self.dir.join(format!(".{}.tmp", filename));
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    fn read(&self, filename: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.dir.join(filename)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write the store as CSV, newest first. An empty store writes nothing.
/// Failures are logged and reported as `None`.
pub async fn export_csv(store: &AggregateStore, sink: Arc<dyn ArtifactSink>) -> Option<PathBuf> {
    let pairs = store.snapshot_newest_first().await;
    if pairs.is_empty() {
        info!("[Export] Nothing to export");
        return None;
    }
    let count = pairs.len();
    let csv = csv_codec::encode(&pairs);
    match tokio::task::spawn_blocking(move || sink.write(EXPORT_FILENAME, &csv)).await {
        Ok(Ok(path)) => {
            info!("[Export] Exported {} with {} ticker-post pairs", path.display(), count);
            Some(path)
        }
        Ok(Err(e)) => {
            error!("[Export] Export failed: {}", e);
            None
        }
        Err(e) => {
            error!("[Export] Export task failed: {}", e);
            None
        }
    }
}

/// Read back the last export so it can be merged into the store again.
pub async fn load_existing(sink: Arc<dyn ArtifactSink>) -> std::result::Result<Vec<TickerPostPair>, ImportError> {
    let text = match tokio::task::spawn_blocking(move || sink.read(EXPORT_FILENAME)).await {
        Ok(Ok(Some(text))) => text,
        Ok(Ok(None)) => return Err(ImportError::NoExistingExport),
        Ok(Err(e)) => return Err(ImportError::Unreadable(e.to_string())),
        Err(e) => return Err(ImportError::Unreadable(e.to_string())),
    };
    info!("[Export] Loaded existing {} ({} bytes)", EXPORT_FILENAME, text.len());
    csv_codec::decode_upload(Some(EXPORT_FILENAME), &text)
}
