// CSV export/import for ticker pairs.
//
// Fields are split on every comma with no quoting; a URL containing a comma
// does not round-trip. Existing export files depend on this layout.

use crate::error::ImportError;
use crate::types::{capture_instant, TickerPostPair};
use tracing::debug;

pub const HEADER: &str = "Ticker,Post URL,Timestamp";

/* ---------------- Writing ---------------- */

/// Serialize pairs in the order given. Callers pass newest-first for exports.
pub fn encode<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = &'a TickerPostPair>,
{
    let mut out = String::with_capacity(64);
    out.push_str(HEADER);
    out.push('\n');
    for pair in pairs {
        out.push('$');
        out.push_str(&pair.ticker);
        out.push(',');
        out.push_str(&pair.url);
        out.push(',');
        out.push_str(pair.timestamp.as_deref().unwrap_or(""));
        out.push('\n');
    }
    out
}

/* ---------------- Parsing ---------------- */

/// Parse CSV text into pairs. The first line is always treated as the header.
/// Rows missing a ticker or URL are skipped.
pub fn decode(text: &str) -> Vec<TickerPostPair> {
    let mut pairs = Vec::new();
    let lines: Vec<&str> = text.trim().lines().collect();
    debug!("CSV parsing - total lines: {}", lines.len());

    for line in lines.iter().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < 2 {
            continue;
        }

        let ticker = parts[0].strip_prefix('$').unwrap_or(parts[0]).trim().to_uppercase();
        let url = strip_wrapping_quote(parts[1].trim()).to_string();
        let timestamp = match parts.get(2) {
            Some(ts) => Some(ts.trim().to_string()).filter(|ts| !ts.is_empty()),
            None => Some(capture_instant()),
        };

        if ticker.is_empty() || url.is_empty() {
            continue;
        }
        pairs.push(TickerPostPair::new(ticker, url, timestamp));
    }

    debug!("Total pairs parsed: {}", pairs.len());
    pairs
}

/// Drop one leading and one trailing quote character, if present.
fn strip_wrapping_quote(s: &str) -> &str {
    let s = s.strip_prefix(['"', '\'']).unwrap_or(s);
    s.strip_suffix(['"', '\'']).unwrap_or(s)
}

/// Validate an uploaded CSV and decode it.
pub fn decode_upload(filename: Option<&str>, text: &str) -> Result<Vec<TickerPostPair>, ImportError> {
    if let Some(name) = filename {
        if !name.to_lowercase().ends_with(".csv") {
            return Err(ImportError::NotCsv);
        }
    }
    if text.trim().is_empty() {
        return Err(ImportError::Empty);
    }
    let pairs = decode(text);
    if pairs.is_empty() {
        return Err(ImportError::NoValidPairs);
    }
    Ok(pairs)
}
