//! Per-source configuration.

use serde::{Deserialize, Serialize};

use crate::error::{ScrapeError, ScrapeResult};
use crate::extract::{ExtractionRules, Extractor, FilterRules};
use crate::models::{BuyerFeeConfig, RunParams, ScrapeTarget};
use crate::pagination::LoadMoreControls;

/// Request budget tier. Decides detail batch size and breaker threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceBudget {
    #[default]
    Low,
    High,
}

impl SourceBudget {
    pub fn batch_size(&self) -> usize {
        match self {
            Self::Low => 25,
            Self::High => 50,
        }
    }

    pub fn breaker_threshold(&self) -> u32 {
        match self {
            Self::Low => 5,
            Self::High => 10,
        }
    }
}

/// Rate-limiting sleeps between remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delays {
    #[serde(default = "default_inter_target_ms")]
    pub inter_target_ms: u64,
    #[serde(default = "default_inter_item_ms")]
    pub inter_item_ms: u64,
}

fn default_inter_target_ms() -> u64 {
    5000
}

fn default_inter_item_ms() -> u64 {
    2000
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            inter_target_ms: default_inter_target_ms(),
            inter_item_ms: default_inter_item_ms(),
        }
    }
}

/// One auction site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Display name; the config key is used when empty.
    #[serde(default)]
    pub name: String,
    /// Base for resolving relative listing links.
    pub base_url: String,
    #[serde(default)]
    pub budget: SourceBudget,
    #[serde(default)]
    pub targets: Vec<ScrapeTarget>,
    pub extraction: ExtractionRules,
    #[serde(default)]
    pub load_more: LoadMoreControls,
    #[serde(default)]
    pub filters: FilterRules,
    /// Fee schedule; sources without one get no fee annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer_fee: Option<BuyerFeeConfig>,
    #[serde(default)]
    pub delays: Delays,
}

impl SourceConfig {
    pub fn display_name<'a>(&'a self, key: &'a str) -> &'a str {
        if self.name.is_empty() {
            key
        } else {
            &self.name
        }
    }

    /// Targets selected by the run's model and trim filters, in config order.
    pub fn select_targets(&self, params: &RunParams) -> Vec<&ScrapeTarget> {
        self.targets
            .iter()
            .filter(|t| t.matches(params.model.as_deref(), params.trim.as_deref()))
            .collect()
    }

    pub fn extractor(&self) -> ScrapeResult<Extractor> {
        Extractor::new(
            self.base_url.clone(),
            self.extraction.clone(),
            self.filters.clone(),
            self.buyer_fee,
        )
    }

    /// Reject configs that could never produce a listing.
    pub fn validate(&self, key: &str) -> ScrapeResult<()> {
        if url::Url::parse(&self.base_url).is_err() {
            return Err(ScrapeError::Config(format!(
                "source {}: base_url {:?} is not an absolute URL",
                key, self.base_url
            )));
        }
        if self.extraction.structured.is_none() && self.extraction.cards.is_none() {
            return Err(ScrapeError::Config(format!(
                "source {}: extraction needs a structured or cards section",
                key
            )));
        }
        for target in &self.targets {
            if target.slug.trim().is_empty() {
                return Err(ScrapeError::Config(format!(
                    "source {}: target {:?} has an empty slug",
                    key, target.model
                )));
            }
        }
        Ok(())
    }
}
