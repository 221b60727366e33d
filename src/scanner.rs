use crate::canonical::{normalize_post_url, Canonicalizer};
use crate::deduplication::SessionDeduplicator;
use crate::markup::Document;
use crate::types::TickerPostPair;

/// Walks page snapshots and reports pairs not yet emitted this session.
#[derive(Debug, Default)]
pub struct ExtractionScanner {
    canonicalizer: Canonicalizer,
    session: SessionDeduplicator,
}

impl ExtractionScanner {
    pub fn new(canonicalizer: Canonicalizer) -> Self {
        Self { canonicalizer, session: SessionDeduplicator::new() }
    }

    pub fn scan_html(&mut self, html: &str) -> Vec<TickerPostPair> {
        self.scan(&Document::parse(html))
    }

    /// New pairs in document order. Only the session cache is touched.
    pub fn scan(&mut self, doc: &Document) -> Vec<TickerPostPair> {
        let mut batch = Vec::new();
        let links = doc
            .elements()
            .filter(|&id| doc.name(id) == "a" && doc.attr(id, "href").is_some_and(|h| h.contains("=%24")));

        for link in links {
            let Some(pair) = self.canonicalizer.canonicalize(doc, link) else { continue };
            let key = pair.key();
            if self.session.seen(&key) {
                continue;
            }
            self.session.mark_seen(key);
            batch.push(pair);
        }
        batch
    }

    /// Accept pairs extracted elsewhere: clean them up the same way a scan
    /// would and drop any this session already emitted.
    pub fn admit(&mut self, pairs: Vec<TickerPostPair>) -> Vec<TickerPostPair> {
        let mut batch = Vec::new();
        for mut pair in pairs {
            pair.ticker = pair.ticker.trim().trim_start_matches('$').to_ascii_uppercase();
            if pair.ticker.is_empty() || !pair.ticker.chars().all(|c| c.is_ascii_alphabetic()) {
                continue;
            }
            if pair.url.trim().is_empty() {
                continue;
            }
            pair.url = normalize_post_url(pair.url.trim(), self.canonicalizer.origin());
            let key = pair.key();
            if self.session.seen(&key) {
                continue;
            }
            self.session.mark_seen(key);
            batch.push(pair);
        }
        batch
    }

    pub fn clear_session(&mut self) {
        self.session.clear();
    }

    pub fn session_size(&self) -> usize {
        self.session.len()
    }
}
