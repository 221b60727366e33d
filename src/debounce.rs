use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Coalesces bursts of triggers into one item released after a quiet period.
///
/// Holds at most one pending item; pushing replaces it and restarts the
/// timer. `ready` is cancel-safe, so it can sit in a `select!` next to the
/// source of triggers.
#[derive(Debug)]
pub struct Debouncer<T> {
    quiet: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Debouncer<T> {
    pub fn new(quiet: Duration) -> Self {
        Self { quiet, pending: None }
    }

    pub fn push(&mut self, item: T) {
        self.pending = Some((item, Instant::now() + self.quiet));
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the pending item without waiting.
    pub fn take(&mut self) -> Option<T> {
        self.pending.take().map(|(item, _)| item)
    }

    /// Resolves once the pending item has been quiet for the full period.
    /// Never resolves while nothing is pending.
    pub async fn ready(&mut self) -> T {
        let Some(deadline) = self.pending.as_ref().map(|(_, d)| *d) else {
            return std::future::pending().await;
        };
        sleep_until(deadline).await;
        match self.pending.take() {
            Some((item, _)) => item,
            None => std::future::pending().await,
        }
    }
}
