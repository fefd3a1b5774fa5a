//! Detail-page field extraction.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::price::{parse_mileage, parse_price};
use super::{clean_text, extract_path, json_text, StatusMarkers};
use crate::models::DetailFields;

/// 17-character VIN; I, O and Q never appear.
static VIN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-HJ-NPR-Z0-9]{17})\b").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailRules {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Elements whose text reads `label: value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_items: Option<String>,
}

fn default_title() -> String {
    "h1".to_string()
}

impl Default for DetailRules {
    fn default() -> Self {
        Self {
            title: default_title(),
            price: None,
            status: None,
            spec_items: None,
        }
    }
}

fn selector(s: &str) -> Option<Selector> {
    match Selector::parse(s) {
        Ok(sel) => Some(sel),
        Err(e) => {
            debug!("Ignoring invalid detail selector {}: {:?}", s, e);
            None
        }
    }
}

fn first_text(document: &Html, sel: &str) -> Option<String> {
    let sel = selector(sel)?;
    let text = clean_text(document.select(&sel).next()?.text());
    (!text.is_empty()).then_some(text)
}

/// Attribute key from an item label: lowercase, words joined by `_`.
fn attribute_key(label: &str) -> String {
    label
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

fn spec_items(document: &Html, sel: &str) -> Vec<(String, String)> {
    let Some(sel) = selector(sel) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|el| {
            let text = clean_text(el.text());
            let (label, value) = text.split_once(':')?;
            let key = attribute_key(label);
            let value = value.trim();
            (!key.is_empty() && !value.is_empty()).then(|| (key, value.to_string()))
        })
        .collect()
}

/// `offers.price` and `name` from JSON-LD blocks.
fn json_ld(document: &Html) -> (Option<String>, Option<String>) {
    let Some(sel) = selector(r#"script[type="application/ld+json"]"#) else {
        return (None, None);
    };
    for script in document.select(&sel) {
        let text: String = script.text().collect();
        let Ok(data) = serde_json::from_str::<serde_json::Value>(text.trim()) else {
            continue;
        };
        let nodes: Vec<&serde_json::Value> = match data {
            serde_json::Value::Array(ref items) => items.iter().collect(),
            ref other => vec![other],
        };
        for node in nodes {
            let price = json_text(extract_path(node, "offers.price"))
                .or_else(|| json_text(extract_path(node, "offers.0.price")));
            if price.is_some() {
                return (price, json_text(extract_path(node, "name")));
            }
        }
    }
    (None, None)
}

/// Parse a single listing's detail page.
pub fn extract_detail(html: &str, rules: &DetailRules, markers: &StatusMarkers) -> DetailFields {
    let document = Html::parse_document(html);
    let mut fields = DetailFields {
        title: first_text(&document, &rules.title),
        ..Default::default()
    };

    if let Some(raw) = rules.price.as_deref().and_then(|sel| first_text(&document, sel)) {
        fields.price = parse_price(&raw);
        fields.raw_price = Some(raw);
    }

    let (ld_price, ld_name) = json_ld(&document);
    if fields.price.is_none() {
        if let Some(raw) = ld_price {
            fields.price = parse_price(&raw);
            fields.raw_price = Some(raw);
        }
    }
    if fields.title.is_none() {
        fields.title = ld_name;
    }

    fields.status = rules
        .status
        .as_deref()
        .and_then(|sel| first_text(&document, sel))
        .and_then(|text| markers.classify(&text));

    if let Some(ref sel) = rules.spec_items {
        fields.attributes.extend(spec_items(&document, sel));
    }

    let body_text = clean_text(document.root_element().text());
    if !fields.attributes.contains_key("vin") {
        if let Some(vin) = VIN_PATTERN.captures(&body_text).and_then(|c| c.get(1)) {
            // Require a digit so long all-caps words are not mistaken for VINs
            if vin.as_str().chars().any(|c| c.is_ascii_digit()) {
                fields.attributes.insert("vin".to_string(), vin.as_str().to_string());
            }
        }
    }

    let mileage = fields
        .attributes
        .get("mileage")
        .or_else(|| fields.attributes.get("miles"))
        .and_then(|m| parse_mileage(m).or_else(|| parse_price(m)))
        .or_else(|| parse_mileage(&body_text));
    if let Some(miles) = mileage {
        fields.attributes.insert("mileage".to_string(), miles.to_string());
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ListingStatus;

    fn rules() -> DetailRules {
        DetailRules {
            title: "h1.post-title".into(),
            price: Some(".current-bid".into()),
            status: Some(".auction-result".into()),
            spec_items: Some("ul.essentials li".into()),
        }
    }

    #[test]
    fn test_full_detail_page() {
        let html = r#"
            <h1 class="post-title">2004 Porsche 911 GT3</h1>
            <span class="current-bid">$98,250</span>
            <div class="auction-result">Sold for $98,250 on 5/1/24</div>
            <ul class="essentials">
              <li>Chassis: WP0AC29964S692123</li>
              <li>Mileage: 41k Miles</li>
              <li>Location: Denver, Colorado</li>
              <li>no separator here</li>
            </ul>
        "#;
        let fields = extract_detail(html, &rules(), &StatusMarkers::default());
        assert_eq!(fields.title.as_deref(), Some("2004 Porsche 911 GT3"));
        assert_eq!(fields.price, Some(98_250));
        assert_eq!(fields.status, Some(ListingStatus::Sold));
        assert_eq!(fields.attributes.get("chassis").map(String::as_str), Some("WP0AC29964S692123"));
        assert_eq!(fields.attributes.get("vin").map(String::as_str), Some("WP0AC29964S692123"));
        assert_eq!(fields.attributes.get("mileage").map(String::as_str), Some("41000"));
        assert_eq!(fields.attributes.get("location").map(String::as_str), Some("Denver, Colorado"));
        assert_eq!(fields.attributes.len(), 4);
    }

    #[test]
    fn test_json_ld_price_fallback() {
        let html = r#"
            <script type="application/ld+json">
              {"@type": "Product", "name": "1973 Porsche 911 Carrera RS", "offers": {"price": "1250000", "priceCurrency": "USD"}}
            </script>
            <p>Showing 63,000 miles.</p>
        "#;
        let fields = extract_detail(html, &DetailRules::default(), &StatusMarkers::default());
        assert_eq!(fields.price, Some(1_250_000));
        assert_eq!(fields.title.as_deref(), Some("1973 Porsche 911 Carrera RS"));
        assert_eq!(fields.status, None);
        assert_eq!(fields.attributes.get("mileage").map(String::as_str), Some("63000"));
    }

    #[test]
    fn test_vin_rejects_forbidden_letters() {
        let html = "<p>VIN: WP0AB2966NS4Q0123 and nothing else</p>";
        let fields = extract_detail(html, &DetailRules::default(), &StatusMarkers::default());
        assert!(!fields.attributes.contains_key("vin"));
    }

    #[test]
    fn test_empty_page() {
        let fields = extract_detail("<html></html>", &rules(), &StatusMarkers::default());
        assert_eq!(fields, DetailFields::default());
    }
}
