//! Incremental "load more" pagination with an early stop.
//!
//! Every few clicks the controller looks at the most recently loaded items.
//! When most of them are already persisted, the rest of the result set is
//! assumed to be known and loading stops.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ScrapeError, ScrapeResult};
use crate::extract::{reconcile, Extractor, RawContent};
use crate::gateway::{ElementState, Gateway, PageAction, RemotePage};
use crate::models::{CandidateListing, ScrapeTarget};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Hard cap on load-more clicks per target.
pub const MAX_CLICKS: u32 = 50;

/// Clicks allowed for a requested page count.
pub fn max_clicks(requested_pages: u32) -> u32 {
    requested_pages.min(MAX_CLICKS)
}

/// Fraction of the last `window` URLs already in `existing`.
pub fn duplicate_ratio(urls: &[String], existing: &HashSet<String>, window: usize) -> f64 {
    let start = urls.len().saturating_sub(window);
    let recent = &urls[start..];
    if recent.is_empty() {
        return 0.0;
    }
    let duplicates = recent.iter().filter(|u| existing.contains(*u)).count();
    duplicates as f64 / recent.len() as f64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval: u32,
    #[serde(default = "default_items_per_load")]
    pub items_per_load: u32,
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f64,
    /// Consecutive busy polls tolerated before giving up.
    #[serde(default = "default_max_busy_checks")]
    pub max_busy_checks: u32,
    /// Wait after the initial scroll and after each click.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Wait between busy re-checks.
    #[serde(default = "default_busy_wait_ms")]
    pub busy_wait_ms: u64,
}

fn default_check_interval() -> u32 {
    3
}

fn default_items_per_load() -> u32 {
    20
}

fn default_duplicate_threshold() -> f64 {
    0.8
}

fn default_max_busy_checks() -> u32 {
    10
}

fn default_settle_ms() -> u64 {
    1500
}

fn default_busy_wait_ms() -> u64 {
    1000
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            items_per_load: default_items_per_load(),
            duplicate_threshold: default_duplicate_threshold(),
            max_busy_checks: default_max_busy_checks(),
            settle_ms: default_settle_ms(),
            busy_wait_ms: default_busy_wait_ms(),
        }
    }
}

/// Page controls used to load more results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadMoreControls {
    /// The load-more button. Without one, only the first page is read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Loading indicator shown while more results are fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_selector: Option<String>,
}

/// Click accounting for one target.
#[derive(Debug, Clone)]
pub struct PaginationState {
    clicks: u32,
    cap: u32,
    interval: u32,
    window: usize,
    threshold: f64,
}

impl PaginationState {
    pub fn new(requested_pages: u32, config: &PaginationConfig) -> Self {
        let interval = config.check_interval.max(1);
        Self {
            clicks: 0,
            cap: max_clicks(requested_pages),
            interval,
            window: (interval * config.items_per_load) as usize,
            threshold: config.duplicate_threshold,
        }
    }

    pub fn clicks(&self) -> u32 {
        self.clicks
    }

    pub fn click_cap(&self) -> u32 {
        self.cap
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn can_click(&self) -> bool {
        self.clicks < self.cap
    }

    /// Count a click. Refuses to go past the cap.
    pub fn record_click(&mut self) -> bool {
        if !self.can_click() {
            return false;
        }
        self.clicks += 1;
        true
    }

    /// The duplicate check runs at positive multiples of the interval, and
    /// only when something is already persisted.
    pub fn should_check(&self, have_existing: bool) -> bool {
        have_existing && self.clicks > 0 && self.clicks % self.interval == 0
    }

    pub fn is_converged(&self, ratio: f64) -> bool {
        ratio >= self.threshold
    }
}

/// Why loading stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    ClickCap,
    /// Recent items were mostly known already.
    Converged { ratio: f64 },
    /// No load-more control left.
    Exhausted,
    /// The control stayed busy, or an in-page step failed.
    Stalled,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PaginationOutcome {
    pub content: RawContent,
    pub clicks: u32,
    pub stop: StopReason,
}

/// Drives search-page loading for one target at a time.
pub struct PaginationController {
    gateway: Arc<dyn Gateway>,
    executor: RetryExecutor,
    config: PaginationConfig,
    policy: RetryPolicy,
}

impl PaginationController {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        executor: RetryExecutor,
        config: PaginationConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            executor,
            config,
            policy,
        }
    }

    /// Load every result for `target`, stopping early once the recent items
    /// are mostly in `existing`.
    pub async fn load_all(
        &self,
        target: &ScrapeTarget,
        existing: &HashSet<String>,
        max_pages: u32,
        extractor: &Extractor,
        controls: &LoadMoreControls,
    ) -> ScrapeResult<PaginationOutcome> {
        let mut page = self.open_search_page(target).await?;
        let result = self.paginate(page.as_mut(), target, existing, max_pages, extractor, controls).await;
        page.close().await;
        result
    }

    /// Open and navigate under the search retry policy. The page is closed
    /// on every failed attempt.
    async fn open_search_page(&self, target: &ScrapeTarget) -> ScrapeResult<Box<dyn RemotePage>> {
        let timeout = self.policy.timeout;
        let settle = Duration::from_millis(self.config.settle_ms);
        let operation = format!("search:{}", target.slug);

        self.executor
            .execute(&operation, &self.policy, |session| {
                let gateway = self.gateway.clone();
                let url = target.search_url.clone();
                async move {
                    let mut page = gateway.open(&session).await?;
                    let navigated = tokio::time::timeout(timeout, async {
                        page.goto(&url).await?;
                        page.perform(&PageAction::ScrollToBottom).await?;
                        page.perform(&PageAction::Wait(settle)).await?;
                        Ok::<_, ScrapeError>(())
                    })
                    .await;
                    match navigated {
                        Ok(Ok(())) => Ok(page),
                        Ok(Err(e)) => {
                            page.close().await;
                            Err(e)
                        }
                        Err(_) => {
                            page.close().await;
                            Err(ScrapeError::Timeout(timeout, url))
                        }
                    }
                }
            })
            .await
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = ScrapeResult<T>>) -> ScrapeResult<T> {
        tokio::time::timeout(self.policy.timeout, fut)
            .await
            .map_err(|_| ScrapeError::Timeout(self.policy.timeout, what.to_string()))?
    }

    async fn paginate(
        &self,
        page: &mut dyn RemotePage,
        target: &ScrapeTarget,
        existing: &HashSet<String>,
        max_pages: u32,
        extractor: &Extractor,
        controls: &LoadMoreControls,
    ) -> ScrapeResult<PaginationOutcome> {
        let mut state = PaginationState::new(max_pages, &self.config);
        let mut loaded: Vec<CandidateListing> = Vec::new();
        let mut busy_checks = 0u32;
        let mut last_checked: Option<u32> = None;
        let cancel = self.executor.cancel_token();
        let busy_wait = Duration::from_millis(self.config.busy_wait_ms);
        let settle = Duration::from_millis(self.config.settle_ms);

        let stop = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if !state.can_click() {
                break StopReason::ClickCap;
            }

            if state.should_check(!existing.is_empty()) && last_checked != Some(state.clicks()) {
                last_checked = Some(state.clicks());
                let html = match self.bounded("duplicate check", page.content()).await {
                    Ok(html) => html,
                    Err(e) => {
                        warn!("{}: snapshot failed during pagination: {}", target.slug, e);
                        break StopReason::Stalled;
                    }
                };
                let urls = extractor.item_urls(&html);
                loaded = reconcile(vec![loaded, extractor.parse_snapshot(&html)]);
                let ratio = duplicate_ratio(&urls, existing, state.window());
                debug!(
                    "{}: duplicate ratio {:.2} over last {} of {} items after {} clicks",
                    target.slug,
                    ratio,
                    state.window().min(urls.len()),
                    urls.len(),
                    state.clicks()
                );
                if state.is_converged(ratio) {
                    break StopReason::Converged { ratio };
                }
            }

            let Some(ref selector) = controls.selector else {
                break StopReason::Exhausted;
            };
            let control = self
                .bounded("load-more lookup", page.element_state(selector, controls.busy_selector.as_deref()))
                .await;
            match control {
                Ok(ElementState::Absent) => break StopReason::Exhausted,
                Ok(ElementState::Busy) => {
                    busy_checks += 1;
                    if busy_checks > self.config.max_busy_checks {
                        warn!("{}: load-more stayed busy, stopping", target.slug);
                        break StopReason::Stalled;
                    }
                    tokio::time::sleep(busy_wait).await;
                }
                Ok(ElementState::Ready) => {
                    busy_checks = 0;
                    let clicked = self
                        .bounded("load-more click", page.perform(&PageAction::Click(selector.clone())))
                        .await;
                    if let Err(e) = clicked {
                        warn!("{}: load-more click failed: {}", target.slug, e);
                        break StopReason::Stalled;
                    }
                    state.record_click();
                    tokio::time::sleep(settle).await;
                }
                Err(e) => {
                    warn!("{}: load-more lookup failed: {}", target.slug, e);
                    break StopReason::Stalled;
                }
            }
        };

        let html = self.bounded("final snapshot", page.content()).await?;
        info!(
            "{}: pagination stopped after {} clicks ({:?})",
            target.slug,
            state.clicks(),
            stop
        );

        Ok(PaginationOutcome {
            content: RawContent {
                url: target.search_url.clone(),
                html,
                loaded,
            },
            clicks: state.clicks(),
            stop,
        })
    }
}
