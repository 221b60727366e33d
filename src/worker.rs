//! Single writer for the aggregate store.
//!
//! Every mutation arrives as a `StoreMessage` on one ordered channel, so at
//! most one merge is ever in flight.

use crate::error::ImportError;
use crate::export::{export_csv, load_existing, ArtifactSink};
use crate::store::AggregateStore;
use crate::types::{BulkReport, TickerPostPair};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug)]
pub enum StoreMessage {
    /// Batch from an extraction session.
    NewPairs(Vec<TickerPostPair>),
    /// Re-hydrate from durable storage.
    Reload { reply: Option<oneshot::Sender<usize>> },
    ExportNow { reply: Option<oneshot::Sender<Option<PathBuf>>> },
    /// Bulk CSV import.
    Import { pairs: Vec<TickerPostPair>, reply: oneshot::Sender<BulkReport> },
    /// Merge the last CSV export back in.
    ImportExisting { reply: Option<oneshot::Sender<Result<BulkReport, ImportError>>> },
    Clear { reply: Option<oneshot::Sender<()>> },
}

/// Deliver a message, logging instead of failing if the worker is gone.
pub async fn send_best_effort(tx: &mpsc::Sender<StoreMessage>, msg: StoreMessage) -> bool {
    match tx.send(msg).await {
        Ok(()) => true,
        Err(_) => {
            warn!("[Worker] Store channel closed, message dropped");
            false
        }
    }
}

pub struct StoreWorker {
    store: Arc<AggregateStore>,
    sink: Arc<dyn ArtifactSink>,
}

impl StoreWorker {
    pub fn new(store: Arc<AggregateStore>, sink: Arc<dyn ArtifactSink>) -> Self {
        Self { store, sink }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<StoreMessage>) {
        info!("[Worker] Store worker started");
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
        }
        if let Err(e) = self.store.flush().await {
            error!("[Worker] Final flush failed: {}", e);
        }
        info!("[Worker] Store channel closed, worker stopped");
    }

    pub async fn handle(&self, msg: StoreMessage) {
        match msg {
            StoreMessage::NewPairs(batch) => {
                if batch.is_empty() {
                    return;
                }
                let report = self.store.merge_incremental(batch).await;
                if report.export_due {
                    info!("[Worker] Auto-exporting CSV after new pairs detected");
                    export_csv(&self.store, Arc::clone(&self.sink)).await;
                }
            }
            StoreMessage::Reload { reply } => {
                let count = self.store.reload().await;
                if let Some(reply) = reply {
                    let _ = reply.send(count);
                }
            }
            StoreMessage::ExportNow { reply } => {
                let path = export_csv(&self.store, Arc::clone(&self.sink)).await;
                self.store.reset_emissions().await;
                if let Some(reply) = reply {
                    let _ = reply.send(path);
                }
            }
            StoreMessage::Import { pairs, reply } => {
                let report = self.store.merge_bulk(pairs).await;
                let _ = reply.send(report);
            }
            StoreMessage::ImportExisting { reply } => {
                let result = match load_existing(Arc::clone(&self.sink)).await {
                    Ok(pairs) => Ok(self.store.merge_bulk(pairs).await),
                    Err(e) => {
                        info!("[Worker] Existing export not loaded: {}", e);
                        Err(e)
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            StoreMessage::Clear { reply } => {
                self.store.clear().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }
}

/// Periodically write the store if it changed since the last write.
pub async fn persistence_sweep(store: Arc<AggregateStore>, every: Duration) {
    info!("[Worker] Persistence sweep every {:?}", every);
    let mut timer = interval(every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    timer.tick().await;
    loop {
        timer.tick().await;
        match store.flush().await {
            Ok(true) => debug!("[Worker] Sweep persisted {} pairs", store.size().await),
            Ok(false) => {}
            Err(e) => error!("[Worker] Sweep failed to persist: {}", e),
        }
    }
}
