use crate::types::TickerPostPair;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

pub const TOP_N: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    AllTime,
    DaysBack(u32),
}

impl TimeWindow {
    /// `0` means no limit.
    pub fn from_days(days: u32) -> Self {
        if days == 0 { Self::AllTime } else { Self::DaysBack(days) }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::AllTime => None,
            // Windows reaching past the representable range cover everything.
            Self::DaysBack(days) => now.checked_sub_signed(Duration::days(i64::from(*days))),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::AllTime => "All time".to_string(),
            Self::DaysBack(1) => "Last 1 day".to_string(),
            Self::DaysBack(days) => format!("Last {} days", days),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickerMention {
    pub ticker: String,
    pub count: usize,
    pub latest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MentionReport {
    pub window: String,
    pub mentions: Vec<TickerMention>,
}

/// RFC 3339 first, then zone-less date-times and bare dates, read as UTC.
fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(ts, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(ts, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Most mentioned tickers inside `window`, highest count first.
///
/// Pairs without a readable timestamp are always inside the window and never
/// contribute to `latest`. Equal counts keep first-encounter order.
pub fn top_mentions(pairs: &[TickerPostPair], window: TimeWindow, now: DateTime<Utc>) -> Vec<TickerMention> {
    let cutoff = window.cutoff(now);
    let mut groups: Vec<TickerMention> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for pair in pairs {
        let ts = pair.timestamp.as_deref().and_then(parse_timestamp);
        if let (Some(cutoff), Some(ts)) = (cutoff, ts) {
            if ts < cutoff {
                continue;
            }
        }

        let ticker = pair.ticker.to_uppercase();
        let slot = *index.entry(ticker.clone()).or_insert_with(|| {
            groups.push(TickerMention { ticker, count: 0, latest: None });
            groups.len() - 1
        });
        let group = &mut groups[slot];
        group.count += 1;
        if ts.is_some() && ts > group.latest {
            group.latest = ts;
        }
    }

    // `sort_by` is stable, so ties stay in encounter order.
    groups.sort_by(|a, b| b.count.cmp(&a.count));
    groups.truncate(TOP_N);
    groups
}

pub fn report(pairs: &[TickerPostPair], window: TimeWindow, now: DateTime<Utc>) -> MentionReport {
    MentionReport { window: window.label(), mentions: top_mentions(pairs, window, now) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
    }

    fn pair(ticker: &str, id: u32, ts: Option<&str>) -> TickerPostPair {
        TickerPostPair::new(ticker, format!("https://x.com/u/status/{}", id), ts.map(str::to_string))
    }

    #[test]
    fn counts_and_orders_by_mentions() {
        let pairs = vec![
            pair("AAPL", 1, Some("2024-01-02T00:00:00Z")),
            pair("OSCR", 2, Some("2024-01-03T00:00:00Z")),
            pair("OSCR", 3, Some("2024-01-05T00:00:00Z")),
            pair("TSLA", 4, None),
        ];
        let top = top_mentions(&pairs, TimeWindow::AllTime, now());
        assert_eq!(top[0].ticker, "OSCR");
        assert_eq!(top[0].count, 2);
        assert_eq!(top[0].latest, Some(Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap()));
        // Tie between AAPL and TSLA keeps encounter order.
        assert_eq!(top[1].ticker, "AAPL");
        assert_eq!(top[2].ticker, "TSLA");
        assert_eq!(top[2].latest, None);
    }

    #[test]
    fn window_drops_old_pairs_but_keeps_undated() {
        let pairs = vec![
            pair("OLD", 1, Some("2023-12-01T00:00:00Z")),
            pair("NEW", 2, Some("2024-01-09T12:00:00Z")),
            pair("UNDATED", 3, None),
            pair("GARBLED", 4, Some("yesterday")),
        ];
        let top = top_mentions(&pairs, TimeWindow::DaysBack(7), now());
        let tickers: Vec<&str> = top.iter().map(|m| m.ticker.as_str()).collect();
        assert_eq!(tickers, ["NEW", "UNDATED", "GARBLED"]);
    }

    #[test]
    fn windowed_result_is_subset_of_all_time() {
        let pairs: Vec<_> = (0..30)
            .map(|i| pair(["A", "B", "C"][i as usize % 3], i, Some(format!("2024-01-{:02}T00:00:00Z", i % 28 + 1).as_str())))
            .collect();
        let all = top_mentions(&pairs, TimeWindow::AllTime, now());
        for days in [1, 3, 7, 30] {
            for m in top_mentions(&pairs, TimeWindow::DaysBack(days), now()) {
                let full = all.iter().find(|a| a.ticker == m.ticker).unwrap();
                assert!(m.count <= full.count);
            }
        }
    }

    #[test]
    fn date_only_and_zoneless_timestamps_are_dated() {
        let pairs = vec![
            pair("OLD", 1, Some("2023-12-01")),
            pair("NEW", 2, Some("2024-01-09")),
            pair("NEW", 3, Some("2024-01-09 18:30:00")),
        ];
        let top = top_mentions(&pairs, TimeWindow::DaysBack(7), now());
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].ticker, "NEW");
        assert_eq!(top[0].latest, Some(Utc.with_ymd_and_hms(2024, 1, 9, 18, 30, 0).unwrap()));
    }

    #[test]
    fn caps_at_ten() {
        let pairs: Vec<_> = (0..15).map(|i| pair(&format!("T{}", (b'A' + i as u8) as char), i, None)).collect();
        assert_eq!(top_mentions(&pairs, TimeWindow::AllTime, now()).len(), TOP_N);
    }

    #[test]
    fn huge_window_does_not_overflow() {
        let pairs = vec![pair("A", 1, Some("1970-01-01T00:00:00Z"))];
        assert_eq!(top_mentions(&pairs, TimeWindow::DaysBack(u32::MAX), now()).len(), 1);
    }

    #[test]
    fn zero_days_means_all_time() {
        assert_eq!(TimeWindow::from_days(0), TimeWindow::AllTime);
        assert_eq!(TimeWindow::from_days(1).label(), "Last 1 day");
        assert_eq!(TimeWindow::from_days(7).label(), "Last 7 days");
        assert_eq!(TimeWindow::AllTime.label(), "All time");
    }
}
