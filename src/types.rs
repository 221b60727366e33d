use serde::{Deserialize, Serialize};

/// One observation: a ticker mentioned in a post, keyed by `TICKER|url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerPostPair {
    pub ticker: String,
    pub url: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl TickerPostPair {
    pub fn new(ticker: impl Into<String>, url: impl Into<String>, timestamp: Option<String>) -> Self {
        Self { ticker: ticker.into(), url: url.into(), timestamp }
    }

    pub fn key(&self) -> String {
        canonical_key(&self.ticker, &self.url)
    }
}

pub fn canonical_key(ticker: &str, url: &str) -> String {
    format!("{}|{}", ticker, url)
}

/// Current instant in the same shape a browser's `toISOString` produces.
pub fn capture_instant() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MergeReport { pub added: usize, pub export_due: bool }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BulkReport { pub added: usize, pub duplicates: usize }

impl BulkReport {
    pub fn summary(&self) -> String {
        format!("Added {} new pairs ({} duplicates skipped)", self.added, self.duplicates)
    }
}

/// Events pushed by the page-side agent over the ingestion socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PageEvent {
    /// The document possibly changed; carries the current markup.
    Snapshot { html: String },
    /// A batch the page already extracted itself.
    Pairs { pairs: Vec<TickerPostPair> },
    Heartbeat,
}
