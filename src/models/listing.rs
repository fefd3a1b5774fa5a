//! Candidate listing model and buyer-fee annotation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outcome of an auction as shown on the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Sold,
    #[default]
    Active,
    /// Ended without meeting reserve ("bid to").
    Unsold,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sold => "sold",
            Self::Active => "active",
            Self::Unsold => "unsold",
        }
    }

    /// Parse a stored or payload status value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sold" | "closed_sold" => Some(Self::Sold),
            "active" | "live" | "open" => Some(Self::Active),
            "unsold" | "not_sold" | "reserve_not_met" | "no_sale" => Some(Self::Unsold),
            _ => None,
        }
    }
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which extraction strategy produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// Embedded data block on the page. Highest trust.
    StructuredData,
    /// Traversal of rendered result cards.
    RenderedCard,
}

/// Buyer-fee schedule for a source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuyerFeeConfig {
    #[serde(default = "default_fee_rate")]
    pub rate: f64,
    #[serde(default = "default_fee_cap")]
    pub cap: u64,
}

fn default_fee_rate() -> f64 {
    BuyerFee::DEFAULT_RATE
}

fn default_fee_cap() -> u64 {
    BuyerFee::DEFAULT_CAP
}

impl Default for BuyerFeeConfig {
    fn default() -> Self {
        Self {
            rate: BuyerFee::DEFAULT_RATE,
            cap: BuyerFee::DEFAULT_CAP,
        }
    }
}

/// Fee annotation derived from a raw sale price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerFee {
    pub fee: u64,
    /// Settlement price, `pre_fee_price + fee`.
    pub final_price: u64,
    pub pre_fee_price: u64,
}

impl BuyerFee {
    pub const DEFAULT_RATE: f64 = 0.05;
    pub const DEFAULT_CAP: u64 = 7500;

    /// `fee = min(price * rate, cap)`, rounded to whole currency units.
    pub fn compute(price: u64, config: &BuyerFeeConfig) -> Self {
        let fee = ((price as f64) * config.rate).round() as u64;
        let fee = fee.min(config.cap);
        Self {
            fee,
            final_price: price.saturating_add(fee),
            pre_fee_price: price,
        }
    }
}

/// A listing candidate produced by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateListing {
    /// Canonical listing URL, unique key.
    pub url: String,
    pub title: String,
    /// Parsed price in whole currency units.
    pub price: Option<u64>,
    /// Price text as found on the page.
    pub raw_price: Option<String>,
    pub status: ListingStatus,
    pub buyer_fee: Option<BuyerFee>,
    pub strategy: ExtractionStrategy,
    /// Slug of the target that surfaced this listing.
    pub target_slug: Option<String>,
    pub detail_fetched: bool,
    /// Free-form fields from the detail page (vin, mileage, location, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl CandidateListing {
    pub fn new(url: impl Into<String>, title: impl Into<String>, strategy: ExtractionStrategy) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            price: None,
            raw_price: None,
            status: ListingStatus::Active,
            buyer_fee: None,
            strategy,
            target_slug: None,
            detail_fetched: false,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_price(mut self, price: Option<u64>, raw: Option<String>) -> Self {
        self.price = price;
        self.raw_price = raw;
        self
    }

    pub fn with_status(mut self, status: ListingStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_target(mut self, slug: impl Into<String>) -> Self {
        self.target_slug = Some(slug.into());
        self
    }

    /// Annotate with a buyer fee. Only sold listings carry a settlement price.
    pub fn apply_buyer_fee(&mut self, config: &BuyerFeeConfig) {
        self.buyer_fee = match (self.status, self.price) {
            (ListingStatus::Sold, Some(price)) => Some(BuyerFee::compute(price, config)),
            _ => None,
        };
    }

    /// Merge fields parsed from the detail page.
    ///
    /// A known price is never replaced by a missing one.
    pub fn merge_detail(&mut self, detail: DetailFields) {
        if let Some(title) = detail.title.filter(|t| !t.is_empty()) {
            self.title = title;
        }
        if detail.price.is_some() {
            self.price = detail.price;
            self.raw_price = detail.raw_price.or(self.raw_price.take());
        }
        if let Some(status) = detail.status {
            self.status = status;
        }
        self.attributes.extend(detail.attributes);
        self.detail_fetched = true;
    }
}

/// Fields parsed from a single listing's detail page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailFields {
    pub title: Option<String>,
    pub price: Option<u64>,
    pub raw_price: Option<String>,
    pub status: Option<ListingStatus>,
    pub attributes: BTreeMap<String, String>,
}
