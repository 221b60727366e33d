use std::collections::HashSet;

/// Keys already emitted during one extraction session.
///
/// A fast-path filter only: the aggregate store repeats the check on merge,
/// so clearing this at any time costs duplicate traffic, never duplicate data.
#[derive(Debug, Default)]
pub struct SessionDeduplicator {
    seen: HashSet<String>,
}

impl SessionDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn mark_seen(&mut self, key: String) {
        self.seen.insert(key);
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
