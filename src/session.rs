use crate::canonical::Canonicalizer;
use crate::debounce::Debouncer;
use crate::scanner::ExtractionScanner;
use crate::types::{PageEvent, TickerPostPair};
use crate::worker::{send_best_effort, StoreMessage};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Extraction state for one open page.
///
/// The first snapshot is scanned right away; later ones are debounced so a
/// burst of page mutations produces a single scan. Scans run inline in the
/// session loop and therefore never overlap.
pub struct ExtractionSession {
    scanner: ExtractionScanner,
    debouncer: Debouncer<String>,
    store_tx: mpsc::Sender<StoreMessage>,
    scanned_once: bool,
}

impl ExtractionSession {
    pub fn new(canonicalizer: Canonicalizer, quiet: Duration, store_tx: mpsc::Sender<StoreMessage>) -> Self {
        Self {
            scanner: ExtractionScanner::new(canonicalizer),
            debouncer: Debouncer::new(quiet),
            store_tx,
            scanned_once: false,
        }
    }

    /// Runs until the event channel closes. `resets` carries the
    /// clear-session-cache signal.
    pub async fn run(mut self, mut events: mpsc::Receiver<PageEvent>, mut resets: broadcast::Receiver<()>) {
        let mut resets_open = true;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                html = self.debouncer.ready() => self.scan(&html).await,
                reset = resets.recv(), if resets_open => match reset {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        self.scanner.clear_session();
                        info!("[Session] Cache cleared");
                    }
                    Err(RecvError::Closed) => resets_open = false,
                },
            }
        }

        // The page went away mid-burst; still report what it showed last.
        if let Some(html) = self.debouncer.take() {
            self.scan(&html).await;
        }
        debug!("[Session] Ended with {} keys seen", self.scanner.session_size());
    }

    async fn on_event(&mut self, event: PageEvent) {
        match event {
            PageEvent::Snapshot { html } if !self.scanned_once => {
                self.scanned_once = true;
                self.scan(&html).await;
            }
            PageEvent::Snapshot { html } => self.debouncer.push(html),
            PageEvent::Pairs { pairs } => {
                let batch = self.scanner.admit(pairs);
                self.forward(batch).await;
            }
            PageEvent::Heartbeat => {}
        }
    }

    async fn scan(&mut self, html: &str) {
        let batch = self.scanner.scan_html(html);
        self.forward(batch).await;
    }

    async fn forward(&self, batch: Vec<TickerPostPair>) {
        if batch.is_empty() {
            return;
        }
        debug!("[Session] Sending {} new pair(s)", batch.len());
        send_best_effort(&self.store_tx, StoreMessage::NewPairs(batch)).await;
    }
}
