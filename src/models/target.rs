//! Scrape targets and per-run filter parameters.

use serde::{Deserialize, Serialize};

/// Default number of "load more" pages requested per target.
pub const DEFAULT_MAX_PAGES: u32 = 20;

/// One search configuration (model / trim / generation) on a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeTarget {
    /// Display name of the model, e.g. "911".
    pub model: String,
    /// URL-safe slug, e.g. "porsche-911-gt3".
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<String>,
    /// Generation code, e.g. "992".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    pub search_url: String,
    /// More-specific variants to reject when this trim is requested
    /// (e.g. "GT3 RS" for a "GT3" target).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_variants: Vec<String>,
    /// Per-target page cap; overrides the run's `max_pages` when lower.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

impl ScrapeTarget {
    pub fn new(model: impl Into<String>, slug: impl Into<String>, search_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            slug: slug.into(),
            trim: None,
            generation: None,
            search_url: search_url.into(),
            exclude_variants: Vec::new(),
            max_pages: None,
        }
    }

    pub fn with_trim(mut self, trim: impl Into<String>) -> Self {
        self.trim = Some(trim.into());
        self
    }

    pub fn with_generation(mut self, generation: impl Into<String>) -> Self {
        self.generation = Some(generation.into());
        self
    }

    /// Human-readable label for logs.
    pub fn label(&self) -> String {
        let mut label = self.model.clone();
        if let Some(ref trim) = self.trim {
            label.push(' ');
            label.push_str(trim);
        }
        if let Some(ref generation) = self.generation {
            label.push_str(&format!(" ({})", generation));
        }
        label
    }

    /// Whether this target is selected by the requested model/trim filters.
    ///
    /// Model matches the display name or the slug, case-insensitively.
    /// A trim filter only selects targets that carry that exact trim.
    pub fn matches(&self, model: Option<&str>, trim: Option<&str>) -> bool {
        let model_ok = model.is_none_or(|m| {
            self.model.eq_ignore_ascii_case(m) || self.slug.eq_ignore_ascii_case(m)
        });
        let trim_ok = trim.is_none_or(|t| {
            self.trim
                .as_deref()
                .is_some_and(|own| own.eq_ignore_ascii_case(t))
        });
        model_ok && trim_ok
    }

    /// Pages to request for this target under a run-level cap.
    pub fn effective_max_pages(&self, requested: u32) -> u32 {
        self.max_pages.map_or(requested, |own| own.min(requested))
    }
}

/// Caller-supplied selection for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub trim: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Keep only sold listings.
    #[serde(default)]
    pub only_sold: bool,
    /// Run the detail-fetch phase after search.
    #[serde(default)]
    pub fetch_details: bool,
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            model: None,
            trim: None,
            max_pages: DEFAULT_MAX_PAGES,
            only_sold: false,
            fetch_details: false,
        }
    }
}
