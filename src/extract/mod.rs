//! Listing extraction from rendered search and detail pages.
//!
//! Parsers implement [`ListingParser`] over plain HTML strings. The
//! [`Extractor`] runs the configured parsers, reconciles their output by URL
//! (structured data wins), then applies the source's filters.

mod cards;
mod detail;
mod filter;
pub mod price;
mod structured;

pub use cards::{CardParser, CardRules};
pub use detail::{extract_detail, DetailRules};
pub use filter::{matches_trim, FilterRules, TrimMatcher};
pub use structured::{StructuredDataParser, StructuredRules};

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{
    BuyerFeeConfig, CandidateListing, DetailFields, ExtractionStrategy, ListingStatus, ScrapeTarget,
};

/// A strategy that turns page content into candidate listings.
pub trait ListingParser: Send + Sync {
    fn strategy(&self) -> ExtractionStrategy;

    /// Parse all listings found in `html`. URLs are resolved against `base_url`.
    fn parse(&self, html: &str, base_url: &str) -> ScrapeResult<Vec<CandidateListing>>;
}

/// Content collected for one target.
#[derive(Debug, Clone, Default)]
pub struct RawContent {
    pub url: String,
    /// Final page snapshot.
    pub html: String,
    /// Listings parsed from intermediate snapshots.
    pub loaded: Vec<CandidateListing>,
}

/// Text markers that decide listing status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMarkers {
    #[serde(default = "default_sold_markers")]
    pub sold: Vec<String>,
    #[serde(default = "default_unsold_markers")]
    pub unsold: Vec<String>,
}

fn default_sold_markers() -> Vec<String> {
    vec!["sold for".into(), "sold".into()]
}

fn default_unsold_markers() -> Vec<String> {
    vec![
        "bid to".into(),
        "reserve not met".into(),
        "not sold".into(),
        "no sale".into(),
    ]
}

impl Default for StatusMarkers {
    fn default() -> Self {
        Self {
            sold: default_sold_markers(),
            unsold: default_unsold_markers(),
        }
    }
}

impl StatusMarkers {
    /// Classify free text. Unsold markers are checked first since several
    /// of them contain the word "sold".
    pub fn classify(&self, text: &str) -> Option<ListingStatus> {
        let lower = text.to_lowercase();
        if self.unsold.iter().any(|m| lower.contains(&m.to_lowercase())) {
            Some(ListingStatus::Unsold)
        } else if self.sold.iter().any(|m| lower.contains(&m.to_lowercase())) {
            Some(ListingStatus::Sold)
        } else {
            None
        }
    }
}

/// Per-source extraction rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cards: Option<CardRules>,
    #[serde(default)]
    pub detail: DetailRules,
    #[serde(default)]
    pub status: StatusMarkers,
}

/// Runs the configured parsers and filters for one source.
pub struct Extractor {
    base_url: String,
    parsers: Vec<Box<dyn ListingParser>>,
    rules: ExtractionRules,
    filters: FilterRules,
    buyer_fee: Option<BuyerFeeConfig>,
}

impl Extractor {
    pub fn new(
        base_url: impl Into<String>,
        rules: ExtractionRules,
        filters: FilterRules,
        buyer_fee: Option<BuyerFeeConfig>,
    ) -> ScrapeResult<Self> {
        let mut parsers: Vec<Box<dyn ListingParser>> = Vec::new();
        if let Some(ref structured) = rules.structured {
            parsers.push(Box::new(StructuredDataParser::new(structured.clone(), rules.status.clone())?));
        }
        if let Some(ref cards) = rules.cards {
            parsers.push(Box::new(CardParser::new(cards.clone(), rules.status.clone())?));
        }
        if parsers.is_empty() {
            return Err(ScrapeError::Config(
                "extraction rules need a structured or cards section".into(),
            ));
        }
        Ok(Self {
            base_url: base_url.into(),
            parsers,
            rules,
            filters,
            buyer_fee,
        })
    }

    /// Replace the parser list.
    pub fn with_parsers(mut self, parsers: Vec<Box<dyn ListingParser>>) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Parse one snapshot with every strategy and reconcile. No filtering.
    ///
    /// Parser failures are logged and skipped.
    pub fn parse_snapshot(&self, html: &str) -> Vec<CandidateListing> {
        let mut outputs = Vec::with_capacity(self.parsers.len());
        for parser in &self.parsers {
            match parser.parse(html, &self.base_url) {
                Ok(listings) => {
                    debug!("{:?} parser found {} listings", parser.strategy(), listings.len());
                    outputs.push(listings);
                }
                Err(e) => warn!("{:?} parser failed: {}", parser.strategy(), e),
            }
        }
        reconcile(outputs)
    }

    /// Listing URLs in document order, deduplicated.
    pub fn item_urls(&self, html: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for parser in &self.parsers {
            let Ok(listings) = parser.parse(html, &self.base_url) else {
                continue;
            };
            for listing in listings {
                if seen.insert(listing.url.clone()) {
                    urls.push(listing.url);
                }
            }
        }
        urls
    }

    /// Full extraction: parse the final snapshot, reconcile with listings
    /// loaded along the way, then filter and annotate for `target`.
    pub fn extract(&self, content: &RawContent, target: &ScrapeTarget) -> Vec<CandidateListing> {
        let snapshot = self.parse_snapshot(&content.html);
        let merged = reconcile(vec![content.loaded.clone(), snapshot]);
        let kept = self.finalize(merged, target);
        debug!("{}: {} listings after filters", target.slug, kept.len());
        kept
    }

    /// Apply filters and the buyer fee.
    pub fn finalize(&self, listings: Vec<CandidateListing>, target: &ScrapeTarget) -> Vec<CandidateListing> {
        let mut kept = self.filters.apply(listings, target);
        for listing in &mut kept {
            self.annotate(listing);
        }
        kept
    }

    /// Recompute the buyer fee, e.g. after detail data changed the status.
    pub fn annotate(&self, listing: &mut CandidateListing) {
        if let Some(ref fee) = self.buyer_fee {
            listing.apply_buyer_fee(fee);
        }
    }

    /// Parse a detail page.
    pub fn extract_detail(&self, html: &str) -> DetailFields {
        extract_detail(html, &self.rules.detail, &self.rules.status)
    }
}

/// Merge parser outputs by URL.
///
/// A structured-data record replaces a card record for the same URL in any
/// order; otherwise the first record is kept and only its gaps are filled.
/// First-seen order is preserved. Reconciling an already reconciled set with
/// itself is a no-op.
pub fn reconcile(outputs: Vec<Vec<CandidateListing>>) -> Vec<CandidateListing> {
    let mut order: Vec<String> = Vec::new();
    let mut by_url: HashMap<String, CandidateListing> = HashMap::new();

    for listing in outputs.into_iter().flatten() {
        match by_url.get_mut(&listing.url) {
            None => {
                order.push(listing.url.clone());
                by_url.insert(listing.url.clone(), listing);
            }
            Some(existing) => merge_into(existing, listing),
        }
    }

    order.into_iter().filter_map(|url| by_url.remove(&url)).collect()
}

fn merge_into(existing: &mut CandidateListing, incoming: CandidateListing) {
    let incoming_wins = incoming.strategy == ExtractionStrategy::StructuredData
        && existing.strategy != ExtractionStrategy::StructuredData;

    if incoming_wins {
        let mut winner = incoming;
        fill_missing(&mut winner, existing);
        *existing = winner;
    } else {
        fill_missing(existing, &incoming);
    }
}

/// Copy fields from `other` that `into` does not have.
fn fill_missing(into: &mut CandidateListing, other: &CandidateListing) {
    if into.title.is_empty() {
        into.title = other.title.clone();
    }
    if into.price.is_none() {
        into.price = other.price;
        into.raw_price = other.raw_price.clone();
    }
    if into.status == ListingStatus::Active && other.status != ListingStatus::Active {
        into.status = other.status;
    }
    if into.target_slug.is_none() {
        into.target_slug = other.target_slug.clone();
    }
    for (k, v) in &other.attributes {
        into.attributes.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

/// Resolve `href` against `base_url` and normalize it.
///
/// The fragment and any trailing slash are dropped, so the same listing
/// always maps to the same key.
pub fn resolve_url(base_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with("mailto:") {
        return None;
    }
    let resolved = match Url::parse(href) {
        Ok(url) => url,
        Err(_) => Url::parse(base_url).ok()?.join(href).ok()?,
    };
    Some(normalize_url(resolved))
}

fn normalize_url(mut url: Url) -> String {
    url.set_fragment(None);
    let mut s = url.to_string();
    while s.ends_with('/') && url.path() != "/" {
        s.pop();
    }
    if url.path() == "/" && url.query().is_none() {
        s = s.trim_end_matches('/').to_string();
    }
    s
}

/// Extract a value from nested JSON using dot-notation path.
pub fn extract_path<'a>(data: &'a serde_json::Value, path: &str) -> &'a serde_json::Value {
    if path.is_empty() {
        return data;
    }

    let mut current = data;
    for key in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(key).unwrap_or(&serde_json::Value::Null),
            serde_json::Value::Array(arr) => key
                .parse::<usize>()
                .ok()
                .and_then(|idx| arr.get(idx))
                .unwrap_or(&serde_json::Value::Null),
            _ => &serde_json::Value::Null,
        };
    }

    current
}

/// Render a JSON scalar as text.
pub(crate) fn json_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Collapse whitespace runs to single spaces.
pub(crate) fn clean_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(|p| p.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}
