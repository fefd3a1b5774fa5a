//! Embedded structured-data strategy.
//!
//! Many auction sites ship their result set as JSON inside a `<script>` tag,
//! either as a bare document or assigned to a variable. This is the most
//! trustworthy source of listing data when present.

use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::price::{bounded_amount, parse_price};
use super::{extract_path, json_text, resolve_url, ListingParser, StatusMarkers};
use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{CandidateListing, ExtractionStrategy, ListingStatus};

/// Dot-paths to listing fields inside each item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredFields {
    #[serde(default = "default_url_field")]
    pub url: String,
    #[serde(default = "default_title_field")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    /// Status text, e.g. `"sold"` or `"live"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Boolean sold flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sold: Option<String>,
}

fn default_url_field() -> String {
    "url".to_string()
}

fn default_title_field() -> String {
    "title".to_string()
}

impl Default for StructuredFields {
    fn default() -> Self {
        Self {
            url: default_url_field(),
            title: default_title_field(),
            price: Some("price".to_string()),
            status: None,
            sold: None,
        }
    }
}

/// Where the embedded payload lives and how to read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredRules {
    #[serde(default = "default_script_selector")]
    pub script_selector: String,
    /// Regex whose first capture group is the JSON payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_pattern: Option<String>,
    /// Dot-path to the items array.
    #[serde(default)]
    pub items_path: String,
    #[serde(default)]
    pub fields: StructuredFields,
}

fn default_script_selector() -> String {
    r#"script[type="application/json"]"#.to_string()
}

impl Default for StructuredRules {
    fn default() -> Self {
        Self {
            script_selector: default_script_selector(),
            payload_pattern: None,
            items_path: String::new(),
            fields: StructuredFields::default(),
        }
    }
}

pub struct StructuredDataParser {
    rules: StructuredRules,
    script: Selector,
    payload: Option<Regex>,
    markers: StatusMarkers,
}

impl StructuredDataParser {
    pub fn new(rules: StructuredRules, markers: StatusMarkers) -> ScrapeResult<Self> {
        let script = Selector::parse(&rules.script_selector).map_err(|e| {
            ScrapeError::Config(format!("invalid script selector {}: {:?}", rules.script_selector, e))
        })?;
        let payload = rules
            .payload_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ScrapeError::Config(format!("invalid payload pattern: {}", e)))?;
        Ok(Self {
            rules,
            script,
            payload,
            markers,
        })
    }

    fn payloads(&self, html: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        document
            .select(&self.script)
            .filter_map(|el| {
                let text: String = el.text().collect();
                match self.payload {
                    Some(ref re) => re
                        .captures(&text)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string()),
                    None => Some(text),
                }
            })
            .collect()
    }

    fn listing_from_item(&self, item: &serde_json::Value, base_url: &str) -> Option<CandidateListing> {
        let fields = &self.rules.fields;
        let href = json_text(extract_path(item, &fields.url))?;
        let url = resolve_url(base_url, &href)?;
        let title = json_text(extract_path(item, &fields.title)).unwrap_or_default();

        let (price, raw_price) = match fields.price.as_deref().map(|p| extract_path(item, p)) {
            Some(serde_json::Value::Number(n)) => (n.as_f64().and_then(bounded_amount), Some(n.to_string())),
            Some(value) => {
                let raw = json_text(value);
                (raw.as_deref().and_then(parse_price), raw)
            }
            None => (None, None),
        };

        let status = fields
            .status
            .as_deref()
            .and_then(|p| json_text(extract_path(item, p)))
            .and_then(|s| ListingStatus::from_str(&s).or_else(|| self.markers.classify(&s)))
            .or_else(|| {
                fields
                    .sold
                    .as_deref()
                    .and_then(|p| extract_path(item, p).as_bool())
                    .map(|sold| if sold { ListingStatus::Sold } else { ListingStatus::Active })
            })
            .unwrap_or_default();

        Some(
            CandidateListing::new(url, title, ExtractionStrategy::StructuredData)
                .with_price(price, raw_price)
                .with_status(status),
        )
    }
}

impl ListingParser for StructuredDataParser {
    fn strategy(&self) -> ExtractionStrategy {
        ExtractionStrategy::StructuredData
    }

    fn parse(&self, html: &str, base_url: &str) -> ScrapeResult<Vec<CandidateListing>> {
        let mut listings = Vec::new();
        let mut last_error = None;
        let mut parsed_any = false;

        for payload in self.payloads(html) {
            let data: serde_json::Value = match serde_json::from_str(payload.trim()) {
                Ok(data) => data,
                Err(e) => {
                    debug!("Skipping unparseable embedded payload: {}", e);
                    last_error = Some(e);
                    continue;
                }
            };
            let Some(items) = extract_path(&data, &self.rules.items_path).as_array() else {
                continue;
            };
            parsed_any = true;
            listings.extend(items.iter().filter_map(|item| self.listing_from_item(item, base_url)));
        }

        match (parsed_any, last_error) {
            (false, Some(e)) => Err(ScrapeError::Parse(format!("embedded data: {}", e))),
            _ => Ok(listings),
        }
    }
}
