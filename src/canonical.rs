//! Turns a ticker link inside a feed snapshot into a `TickerPostPair`.

use crate::markup::{Document, NodeId};
use crate::types::{capture_instant, TickerPostPair};
use lazy_static::lazy_static;
use regex::Regex;

pub const DEFAULT_ORIGIN: &str = "https://x.com";

/// Encoded `$` as it appears in cashtag search links (`/search?q=%24OSCR`).
pub const ENCODED_TICKER_QUERY: &str = "q=%24";

lazy_static! {
    static ref TICKER_PARAM: Regex = Regex::new(r"(?i)q=%24([A-Z]+)").unwrap();
    static ref INDEXED_MEDIA_SUFFIX: Regex =
        Regex::new(r"/(photo|video|analytics|likes|retweets)/\d+$").unwrap();
    static ref MEDIA_SUFFIX: Regex = Regex::new(r"/(photo|video|analytics)$").unwrap();
}

/// Ticker named by a cashtag search link, upper-cased.
pub fn ticker_from_href(href: &str) -> Option<String> {
    if !href.contains(ENCODED_TICKER_QUERY) {
        return None;
    }
    TICKER_PARAM
        .captures(href)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
}

/// Absolute post URL with the query and any media/analytics tail removed.
pub fn normalize_post_url(href: &str, origin: &str) -> String {
    let mut url = if href.starts_with("http") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{}", origin.trim_end_matches('/'), href)
    } else {
        format!("{}/{}", origin.trim_end_matches('/'), href)
    };

    if let Some(q) = url.find('?') {
        url.truncate(q);
    }

    // Strip until nothing changes so a second pass is always a no-op.
    loop {
        let stripped = INDEXED_MEDIA_SUFFIX.replace(&url, "");
        let stripped = MEDIA_SUFFIX.replace(&stripped, "").into_owned();
        if stripped == url {
            return url;
        }
        url = stripped;
    }
}

pub fn is_repost_or_reply(doc: &Document, container: NodeId) -> bool {
    let social_context = doc.find_descendant(container, |id| {
        doc.attr(id, "data-testid") == Some("socialContext")
    });
    if let Some(ctx) = social_context {
        if doc.text_content(ctx).to_lowercase().contains("repost") {
            return true;
        }
    }
    doc.text_content(container).contains("Replying to @")
}

#[derive(Debug, Clone)]
pub struct Canonicalizer {
    origin: String,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new(DEFAULT_ORIGIN)
    }
}

impl Canonicalizer {
    pub fn new(origin: &str) -> Self {
        Self { origin: origin.to_string() }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Pair for the post that holds `link`, or `None` when the link is not a
    /// cashtag, sits outside a post, belongs to a repost/reply, or the post
    /// has no status permalink.
    pub fn canonicalize(&self, doc: &Document, link: NodeId) -> Option<TickerPostPair> {
        let ticker = ticker_from_href(doc.attr(link, "href")?)?;
        let article = doc.closest(link, "article")?;
        if is_repost_or_reply(doc, article) {
            return None;
        }

        let status = doc.find_descendant(article, |id| {
            doc.name(id) == "a" && doc.attr(id, "href").is_some_and(|h| h.contains("/status/"))
        })?;
        let url = normalize_post_url(doc.attr(status, "href")?, &self.origin);

        let timestamp = doc
            .find_descendant(article, |id| doc.name(id) == "time" && doc.attr(id, "datetime").is_some())
            .and_then(|t| doc.attr(t, "datetime"))
            .map(str::to_string)
            .unwrap_or_else(capture_instant);

        Some(TickerPostPair::new(ticker, url, Some(timestamp)))
    }
}
