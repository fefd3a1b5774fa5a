//! Listing filters: price floor, keyword blocklist, trim disambiguation.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{CandidateListing, ScrapeTarget};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterRules {
    /// Listings priced below this are dropped. Unpriced listings are kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_floor: Option<u64>,
    /// Non-vehicle keywords (wheels, manuals, memorabilia, ...).
    #[serde(default)]
    pub blocklist: Vec<String>,
    /// Vehicle-model keywords that override the blocklist.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Keyword patterns, compiled on first use.
    #[serde(skip)]
    pub(super) keywords: OnceLock<Keywords>,
}

/// Case-insensitive whole-word pattern for one term.
#[derive(Debug, Clone)]
struct Term(Regex);

impl Term {
    fn new(term: &str) -> Option<Self> {
        let term = term.trim();
        if term.is_empty() {
            return None;
        }
        Regex::new(&format!(r"(?i)(?:^|\b|\s){}(?:\b|\s|$)", regex::escape(term)))
            .map(Term)
            .map_err(|e| debug!("Skipping filter term {:?}: {}", term, e))
            .ok()
    }

    fn compile_all<'a>(terms: impl IntoIterator<Item = &'a str>) -> Vec<Self> {
        terms.into_iter().filter_map(Term::new).collect()
    }

    fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

#[derive(Debug, Clone)]
struct Keywords {
    blocklist: Vec<Term>,
    allowlist: Vec<Term>,
}

/// Matches titles that name a trim and none of its more specific variants.
///
/// An `RS` variant of the trim is always treated as more specific.
#[derive(Debug, Clone)]
pub struct TrimMatcher {
    trim: Option<Term>,
    excluded: Vec<Term>,
}

impl TrimMatcher {
    pub fn new(trim: &str, exclude_variants: &[String]) -> Self {
        let rs_variant = format!("{} RS", trim);
        let auto_exclude = (!trim.to_uppercase().ends_with(" RS")).then_some(rs_variant.as_str());
        let excluded = Term::compile_all(
            exclude_variants
                .iter()
                .map(String::as_str)
                .chain(auto_exclude)
                .filter(|variant| !variant.eq_ignore_ascii_case(trim)),
        );
        Self {
            trim: Term::new(trim),
            excluded,
        }
    }

    pub fn matches(&self, title: &str) -> bool {
        match self.trim {
            Some(ref trim) => trim.is_match(title) && !self.excluded.iter().any(|v| v.is_match(title)),
            None => false,
        }
    }
}

/// Whether `title` names `trim` and none of its more specific variants.
pub fn matches_trim(title: &str, trim: &str, exclude_variants: &[String]) -> bool {
    TrimMatcher::new(trim, exclude_variants).matches(title)
}

impl FilterRules {
    pub fn passes_price_floor(&self, listing: &CandidateListing) -> bool {
        match (self.price_floor, listing.price) {
            (Some(floor), Some(price)) => price >= floor,
            _ => true,
        }
    }

    fn keywords(&self) -> &Keywords {
        self.keywords.get_or_init(|| Keywords {
            blocklist: Term::compile_all(self.blocklist.iter().map(String::as_str)),
            allowlist: Term::compile_all(self.allowlist.iter().map(String::as_str)),
        })
    }

    pub fn passes_keywords(&self, listing: &CandidateListing) -> bool {
        let keywords = self.keywords();
        let blocked = keywords.blocklist.iter().any(|k| k.is_match(&listing.title));
        !blocked || keywords.allowlist.iter().any(|k| k.is_match(&listing.title))
    }

    /// Apply the filters in order and tag survivors with the target slug.
    pub fn apply(&self, listings: Vec<CandidateListing>, target: &ScrapeTarget) -> Vec<CandidateListing> {
        let before = listings.len();
        let trim = target
            .trim
            .as_deref()
            .map(|trim| TrimMatcher::new(trim, &target.exclude_variants));
        let kept: Vec<CandidateListing> = listings
            .into_iter()
            .filter(|l| self.passes_price_floor(l))
            .filter(|l| self.passes_keywords(l))
            .filter(|l| trim.as_ref().is_none_or(|m| m.matches(&l.title)))
            .map(|l| l.with_target(target.slug.clone()))
            .collect();
        if kept.len() < before {
            debug!("{}: filtered out {} of {} listings", target.slug, before - kept.len(), before);
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionStrategy;

    fn listing(title: &str, price: Option<u64>) -> CandidateListing {
        CandidateListing::new(
            format!("https://a.com/{}", title.replace(' ', "-")),
            title,
            ExtractionStrategy::RenderedCard,
        )
        .with_price(price, None)
    }

    #[test]
    fn test_price_floor() {
        let rules = FilterRules {
            price_floor: Some(10_000),
            ..Default::default()
        };
        assert!(!rules.passes_price_floor(&listing("cheap", Some(9_999))));
        assert!(rules.passes_price_floor(&listing("ok", Some(10_000))));
        assert!(rules.passes_price_floor(&listing("unknown", None)));
    }

    #[test]
    fn test_blocklist_with_allowlist_override() {
        let rules = FilterRules {
            blocklist: vec!["wheels".into(), "manual".into()],
            allowlist: vec!["911".into()],
            ..Default::default()
        };
        assert!(!rules.passes_keywords(&listing("Fuchs wheels set of four", None)));
        assert!(rules.passes_keywords(&listing("1989 Porsche 911 with extra wheels", None)));
        assert!(rules.passes_keywords(&listing("2005 Porsche Boxster", None)));
    }

    #[test]
    fn test_trim_must_appear_and_rs_excluded() {
        assert!(matches_trim("2022 Porsche 911 GT3 Touring", "GT3", &[]));
        assert!(!matches_trim("2019 Porsche 911 GT3 RS", "GT3", &[]));
        assert!(!matches_trim("2021 Porsche 911 Turbo S", "GT3", &[]));
        assert!(matches_trim("2019 Porsche 911 GT3 RS", "GT3 RS", &[]));
    }

    #[test]
    fn test_configured_variant_exclusion() {
        let variants = vec!["Carrera 4S".to_string()];
        assert!(matches_trim("1999 Porsche 911 Carrera", "Carrera", &variants));
        assert!(!matches_trim("2003 Porsche 911 Carrera 4S", "Carrera", &variants));
    }

    #[test]
    fn test_keyword_terms_are_literal_and_whole_word() {
        let rules = FilterRules {
            blocklist: vec!["  ".into(), "owner's manual".into(), "car.cover".into(), "rim".into()],
            ..Default::default()
        };
        assert!(!rules.passes_keywords(&listing("Porsche 911 Owner's Manual", None)));
        assert!(rules.passes_keywords(&listing("1995 911 with carXcover", None)));
        assert!(rules.passes_keywords(&listing("1995 911 Carrera Trim Package", None)));
        assert!(!rules.passes_keywords(&listing("Single 911 rim", None)));

        // The compiled set travels with clones
        let cloned = rules.clone();
        assert!(!cloned.passes_keywords(&listing("Single 911 rim", None)));
    }

    #[test]
    fn test_trim_matcher_reused_across_titles() {
        let matcher = TrimMatcher::new("Carrera", &["Carrera 4S".to_string(), "carrera".to_string()]);
        assert!(matcher.matches("1999 Porsche 911 Carrera"));
        assert!(!matcher.matches("2003 Porsche 911 Carrera 4S"));
        assert!(!matcher.matches("2004 Porsche 911 Carrera RS"));
        assert!(!matcher.matches("2005 Porsche Boxster"));
        assert!(!TrimMatcher::new(" ", &[]).matches("1999 Porsche 911 Carrera"));
    }

    #[test]
    fn test_apply_order_and_tagging() {
        let rules = FilterRules {
            price_floor: Some(20_000),
            blocklist: vec!["poster".into()],
            ..Default::default()
        };
        let target = ScrapeTarget::new("911", "911-gt3", "https://a.com/s").with_trim("GT3");
        let out = rules.apply(
            vec![
                listing("2022 911 GT3", Some(200_000)),
                listing("2019 911 GT3 RS", Some(250_000)),
                listing("GT3 poster", Some(50)),
                listing("2010 911 GT3", Some(15_000)),
                listing("2004 911 GT3", None),
            ],
            &target,
        );
        let titles: Vec<&str> = out.iter().map(|l| l.title.as_str()).collect();
        assert_eq!(titles, vec!["2022 911 GT3", "2004 911 GT3"]);
        assert!(out.iter().all(|l| l.target_slug.as_deref() == Some("911-gt3")));
    }
}
