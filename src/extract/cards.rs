//! Rendered-card strategy: walk listing cards in the DOM.

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use super::price::parse_price;
use super::{clean_text, resolve_url, ListingParser, StatusMarkers};
use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{CandidateListing, ExtractionStrategy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardRules {
    /// Selector matching one element per listing.
    pub card: String,
    #[serde(default = "default_link")]
    pub link: String,
    /// Title element; defaults to the link text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    /// Element holding the result text; defaults to the whole card.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

fn default_link() -> String {
    "a[href]".to_string()
}

fn parse_selector(s: &str) -> ScrapeResult<Selector> {
    Selector::parse(s).map_err(|e| ScrapeError::Config(format!("invalid selector {}: {:?}", s, e)))
}

pub struct CardParser {
    card: Selector,
    link: Selector,
    title: Option<Selector>,
    price: Option<Selector>,
    status: Option<Selector>,
    markers: StatusMarkers,
}

impl CardParser {
    pub fn new(rules: CardRules, markers: StatusMarkers) -> ScrapeResult<Self> {
        Ok(Self {
            card: parse_selector(&rules.card)?,
            link: parse_selector(&rules.link)?,
            title: rules.title.as_deref().map(parse_selector).transpose()?,
            price: rules.price.as_deref().map(parse_selector).transpose()?,
            status: rules.status.as_deref().map(parse_selector).transpose()?,
            markers,
        })
    }

    fn text_of(card: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
        let el = match selector {
            Some(sel) => card.select(sel).next()?,
            None => card,
        };
        let text = clean_text(el.text());
        (!text.is_empty()).then_some(text)
    }

    fn listing_from_card(&self, card: ElementRef<'_>, base_url: &str) -> Option<CandidateListing> {
        // The card itself may be the anchor
        let href = card
            .value()
            .attr("href")
            .or_else(|| card.select(&self.link).next().and_then(|a| a.value().attr("href")))?;
        let url = resolve_url(base_url, href)?;

        let title = match self.title {
            Some(ref sel) => Self::text_of(card, Some(sel)),
            None => card.select(&self.link).next().map(|a| clean_text(a.text())),
        }
        .unwrap_or_default();

        let raw_price = self.price.as_ref().and_then(|sel| Self::text_of(card, Some(sel)));
        let price = raw_price.as_deref().and_then(parse_price);

        let status = Self::text_of(card, self.status.as_ref())
            .and_then(|text| self.markers.classify(&text))
            .unwrap_or_default();

        Some(
            CandidateListing::new(url, title, ExtractionStrategy::RenderedCard)
                .with_price(price, raw_price)
                .with_status(status),
        )
    }
}

impl ListingParser for CardParser {
    fn strategy(&self) -> ExtractionStrategy {
        ExtractionStrategy::RenderedCard
    }

    fn parse(&self, html: &str, base_url: &str) -> ScrapeResult<Vec<CandidateListing>> {
        let document = Html::parse_document(html);
        Ok(document
            .select(&self.card)
            .filter_map(|card| self.listing_from_card(card, base_url))
            .collect())
    }
}
