//! Scrape runs: search every selected target, then fetch details for the new
//! listings.
//!
//! A run is sequential. Per-target and per-item failures are logged and
//! counted; only a failed preflight (gateway check or existing-URL snapshot)
//! aborts the run.

mod detail;

pub use detail::{process_in_batches, BatchOutcome};

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveRequest, ContentArchive};
use crate::config::{Config, RetryConfig, SourceConfig};
use crate::error::{ScrapeError, ScrapeResult};
use crate::extract::{reconcile, Extractor};
use crate::gateway::Gateway;
use crate::models::{ArtifactType, CandidateListing, DetailFields, ListingStatus, RunParams, ScrapeTarget};
use crate::pagination::{PaginationConfig, PaginationController, PaginationOutcome};
use crate::retry::{BatchCircuitBreaker, RetryExecutor};
use crate::session::SessionManager;
use crate::store::ListingStore;

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub targets: usize,
    pub targets_failed: usize,
    /// Candidates extracted across targets, before dedup.
    pub candidates: usize,
    /// Candidates already persisted before the run.
    pub known: usize,
    pub detail_attempts: usize,
    pub detail_successes: usize,
    pub detail_failures: usize,
    pub circuit_tripped: bool,
    pub archive_writes: usize,
    pub archive_failures: usize,
    pub upserts: usize,
    pub upsert_failures: usize,
    pub cancelled: bool,
}

/// Result of a run. Always returned, even after a breaker trip or cancel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub source: String,
    /// New listings, with detail data when the detail phase ran.
    pub listings: Vec<CandidateListing>,
    /// Search-phase records whose detail fetch failed or never ran.
    pub unprocessed: Vec<CandidateListing>,
    pub stats: RunStats,
}

pub struct ScrapeOrchestrator {
    gateway: Arc<dyn Gateway>,
    executor: RetryExecutor,
    store: Arc<dyn ListingStore>,
    archive: Arc<ContentArchive>,
    pagination: PaginationConfig,
    retry: RetryConfig,
}

impl ScrapeOrchestrator {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        executor: RetryExecutor,
        store: Arc<dyn ListingStore>,
        archive: Arc<ContentArchive>,
    ) -> Self {
        Self {
            gateway,
            executor,
            store,
            archive,
            pagination: PaginationConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Build from configuration: a session manager over the configured
    /// egress pool, plus the pagination and retry settings.
    pub fn from_config(
        config: &Config,
        gateway: Arc<dyn Gateway>,
        store: Arc<dyn ListingStore>,
        archive: Arc<ContentArchive>,
        cancel: CancellationToken,
    ) -> ScrapeResult<Self> {
        let sessions = SessionManager::new(
            config.sessions.zones.clone(),
            config.sessions.limits,
            config.sessions.profile(),
        )?;
        let executor = RetryExecutor::new(Arc::new(sessions), cancel);
        Ok(Self::new(gateway, executor, store, archive)
            .with_pagination(config.pagination.clone())
            .with_retry(config.retry))
    }

    pub fn with_pagination(mut self, config: PaginationConfig) -> Self {
        self.pagination = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.executor.cancel_token()
    }

    /// Run every target of `source` selected by `params`.
    pub async fn run(&self, source_id: &str, source: &SourceConfig, params: &RunParams) -> ScrapeResult<RunReport> {
        let mut report = RunReport {
            source: source_id.to_string(),
            ..Default::default()
        };

        let targets = source.select_targets(params);
        if targets.is_empty() {
            warn!(
                "{}: no targets match model={:?} trim={:?}",
                source_id, params.model, params.trim
            );
            return Ok(report);
        }
        let extractor = source.extractor()?;

        // Preflight: transient check failures retry on the search policy,
        // anything still failing afterwards aborts the run
        self.executor
            .execute("preflight", &self.retry.search, |session| {
                let gateway = self.gateway.clone();
                async move { gateway.check(&session).await }
            })
            .await
            .map_err(|e| match e {
                ScrapeError::Connectivity(_) | ScrapeError::Cancelled => e,
                other => {
                    ScrapeError::Connectivity(format!("{} gateway check failed: {}", self.gateway.name(), other))
                }
            })?;
        let existing = self.store.existing_urls(source_id).await?;
        info!(
            "{}: {} targets, {} listings already stored",
            source.display_name(source_id),
            targets.len(),
            existing.len()
        );

        let candidates = self
            .search_phase(source_id, source, &targets, &existing, params, &extractor, &mut report.stats)
            .await;

        let mut fresh = Vec::new();
        for listing in reconcile(vec![candidates]) {
            if params.only_sold && listing.status != ListingStatus::Sold {
                continue;
            }
            if existing.contains(&listing.url) {
                report.stats.known += 1;
                continue;
            }
            fresh.push(listing);
        }
        debug!(
            "{}: {} new listings, {} already known",
            source_id,
            fresh.len(),
            report.stats.known
        );

        let processed = if params.fetch_details && !report.stats.cancelled {
            self.detail_phase(source_id, source, &targets, fresh, &extractor, &mut report)
                .await
        } else {
            fresh
        };

        for listing in &processed {
            match self.store.upsert(source_id, listing).await {
                Ok(_) => report.stats.upserts += 1,
                Err(e) => {
                    warn!("{}: failed to store {}: {}", source_id, listing.url, e);
                    report.stats.upsert_failures += 1;
                }
            }
        }
        report.listings = processed;

        info!(
            "{}: run finished with {} listings ({} unprocessed, {} known){}",
            source_id,
            report.listings.len(),
            report.unprocessed.len(),
            report.stats.known,
            if report.stats.circuit_tripped {
                ", circuit breaker tripped"
            } else {
                ""
            }
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn search_phase(
        &self,
        source_id: &str,
        source: &SourceConfig,
        targets: &[&ScrapeTarget],
        existing: &HashSet<String>,
        params: &RunParams,
        extractor: &Extractor,
        stats: &mut RunStats,
    ) -> Vec<CandidateListing> {
        let controller = PaginationController::new(
            self.gateway.clone(),
            self.executor.clone(),
            self.pagination.clone(),
            self.retry.search,
        );
        let cancel = self.cancel_token();
        let delay = Duration::from_millis(source.delays.inter_target_ms);
        let mut candidates = Vec::new();

        for (i, target) in targets.iter().enumerate() {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            stats.targets += 1;
            let pages = target.effective_max_pages(params.max_pages);
            info!("{}: searching {} (up to {} pages)", source_id, target.label(), pages);

            match controller
                .load_all(target, existing, pages, extractor, &source.load_more)
                .await
            {
                Ok(outcome) => {
                    self.archive_search_page(source_id, target, &outcome, stats).await;
                    let found = extractor.extract(&outcome.content, target);
                    info!("{}: {} listings from {}", source_id, found.len(), target.label());
                    stats.candidates += found.len();
                    candidates.extend(found);
                }
                Err(ScrapeError::Cancelled) => {
                    stats.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!("{}: target {} failed: {}", source_id, target.label(), e);
                    stats.targets_failed += 1;
                }
            }

            if i + 1 < targets.len() && !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        stats.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        candidates
    }

    async fn archive_search_page(
        &self,
        source_id: &str,
        target: &ScrapeTarget,
        outcome: &PaginationOutcome,
        stats: &mut RunStats,
    ) {
        let request = ArchiveRequest::new(
            source_id,
            &outcome.content.url,
            ArtifactType::SearchPage,
            outcome.content.html.as_bytes(),
        )
        .for_target(target)
        .with_metadata(serde_json::json!({
            "target": target.slug,
            "clicks": outcome.clicks,
            "stop": format!("{:?}", outcome.stop),
        }));
        match self.archive.store(request).await {
            Ok(_) => stats.archive_writes += 1,
            Err(e) => {
                warn!("{}: failed to archive search page for {}: {}", source_id, target.slug, e);
                stats.archive_failures += 1;
            }
        }
    }

    async fn detail_phase(
        &self,
        source_id: &str,
        source: &SourceConfig,
        targets: &[&ScrapeTarget],
        listings: Vec<CandidateListing>,
        extractor: &Extractor,
        report: &mut RunReport,
    ) -> Vec<CandidateListing> {
        let mut breaker = BatchCircuitBreaker::new(source.budget.breaker_threshold());
        let delay = Duration::from_millis(source.delays.inter_item_ms);
        info!(
            "{}: fetching details for {} listings (batches of {})",
            source_id,
            listings.len(),
            source.budget.batch_size()
        );

        let archived = AtomicUsize::new(0);
        let archive_failed = AtomicUsize::new(0);
        let outcome = process_in_batches(
            listings,
            source.budget.batch_size(),
            &mut breaker,
            delay,
            self.cancel_token(),
            |listing| {
                let target = listing
                    .target_slug
                    .as_deref()
                    .and_then(|slug| targets.iter().copied().find(|t| t.slug == slug));
                let archived = &archived;
                let archive_failed = &archive_failed;
                async move {
                    let html = self.fetch_detail_page(&listing.url).await?;
                    // An unarchived detail page does not count as a success
                    if let Err(e) = self.archive_detail_page(source_id, target, &listing.url, &html).await {
                        archive_failed.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                    archived.fetch_add(1, Ordering::Relaxed);
                    Self::merge_detail(listing, extractor.extract_detail(&html), extractor)
                }
            },
        )
        .await;

        let stats = &mut report.stats;
        stats.detail_attempts += outcome.attempted();
        stats.detail_successes += outcome.succeeded.len();
        stats.detail_failures += outcome.failed.len();
        stats.circuit_tripped = outcome.tripped;
        stats.cancelled |= outcome.cancelled;
        stats.archive_writes += archived.into_inner();
        stats.archive_failures += archive_failed.into_inner();
        report.unprocessed.extend(outcome.failed);
        report.unprocessed.extend(outcome.unattempted);
        outcome.succeeded
    }

    async fn fetch_detail_page(&self, url: &str) -> ScrapeResult<String> {
        let policy = self.retry.detail;
        let response = self
            .executor
            .execute(&format!("detail:{}", url), &policy, |session| {
                let gateway = self.gateway.clone();
                let url = url.to_string();
                async move { gateway.fetch(&session, &url, &[], policy.timeout).await }
            })
            .await?;
        Ok(response.html)
    }

    async fn archive_detail_page(
        &self,
        source_id: &str,
        target: Option<&ScrapeTarget>,
        url: &str,
        html: &str,
    ) -> ScrapeResult<()> {
        let mut request = ArchiveRequest::new(source_id, url, ArtifactType::DetailPage, html.as_bytes());
        if let Some(target) = target {
            request = request.for_target(target);
        }
        self.archive.store(request).await?;
        Ok(())
    }

    fn merge_detail(
        mut listing: CandidateListing,
        fields: DetailFields,
        extractor: &Extractor,
    ) -> ScrapeResult<CandidateListing> {
        if fields == DetailFields::default() {
            return Err(ScrapeError::Parse(format!("no detail fields found on {}", listing.url)));
        }
        listing.merge_detail(fields);
        extractor.annotate(&mut listing);
        Ok(listing)
    }
}
