mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::{listing_url, orchestrator, source, target, Reply, ScriptedGateway, CARD_PRICE, DETAIL_PRICE};
use lotacquire::archive::{BucketPolicy, ContentArchive, MemoryBlobStore, MemoryLedger};
use lotacquire::models::{ArtifactType, ListingStatus, RunParams};
use lotacquire::store::{ListingStore, MemoryListingStore};
use lotacquire::ScrapeError;

const SEARCH_URL: &str = "https://auctions.test/search?q=911";

fn search_only() -> RunParams {
    RunParams::default()
}

fn with_details() -> RunParams {
    RunParams {
        fetch_details: true,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_search_run_stores_every_new_listing() {
    let gateway = ScriptedGateway::new().search(SEARCH_URL, 0, 45);
    let store = MemoryListingStore::new();
    let archive = Arc::new(ContentArchive::in_memory());
    let orch = orchestrator(&gateway, Arc::new(store.clone()), archive.clone(), CancellationToken::new());

    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &search_only()).await.unwrap();

    assert_eq!(report.source, "bat");
    assert_eq!(report.stats.targets, 1);
    assert_eq!(report.stats.targets_failed, 0);
    assert_eq!(report.stats.candidates, 45);
    assert_eq!(report.listings.len(), 45);
    assert!(report.unprocessed.is_empty());
    assert_eq!(report.stats.upserts, 45);
    assert_eq!(store.len().await, 45);

    // Search-only runs never fetch details
    assert_eq!(report.stats.detail_attempts, 0);
    assert!(report.listings.iter().all(|l| !l.detail_fetched));
    assert!(report
        .listings
        .iter()
        .all(|l| l.target_slug.as_deref() == Some("911-carrera")));

    // Card-level fee on sold listings only
    let sold = report.listings.iter().find(|l| l.url == listing_url(0)).unwrap();
    assert_eq!(sold.status, ListingStatus::Sold);
    assert_eq!(sold.price, Some(CARD_PRICE));
    assert_eq!(sold.buyer_fee.map(|f| f.fee), Some(2500));
    let unsold = report.listings.iter().find(|l| l.url == listing_url(1)).unwrap();
    assert_eq!(unsold.status, ListingStatus::Unsold);
    assert!(unsold.buyer_fee.is_none());

    let history = archive.history("bat", SEARCH_URL).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].artifact, ArtifactType::SearchPage);
    assert_eq!(report.stats.archive_writes, 1);

    // Every page opened was closed
    assert!(gateway.opened() > 0);
    assert_eq!(gateway.opened(), gateway.closed());
}

#[tokio::test(start_paused = true)]
async fn test_known_listings_are_skipped() {
    let gateway = ScriptedGateway::new().search(SEARCH_URL, 0, 45);
    let store = MemoryListingStore::new();
    store.seed("bat", (0..10).map(listing_url)).await;
    let orch = orchestrator(
        &gateway,
        Arc::new(store.clone()),
        Arc::new(ContentArchive::in_memory()),
        CancellationToken::new(),
    );

    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &with_details()).await.unwrap();

    assert_eq!(report.stats.candidates, 45);
    assert_eq!(report.stats.known, 10);
    assert_eq!(report.listings.len(), 35);
    assert!(report.listings.iter().all(|l| !l.url.ends_with("/listing/3")));

    // Known listings get no detail fetch
    let visits = gateway.visits();
    assert!(!visits.contains(&listing_url(3)));
    assert!(visits.contains(&listing_url(10)));
    assert_eq!(report.stats.detail_attempts, 35);
    assert_eq!(store.len().await, 45);
}

#[tokio::test(start_paused = true)]
async fn test_only_sold_filters_before_details() {
    let gateway = ScriptedGateway::new().search(SEARCH_URL, 0, 10);
    let store = MemoryListingStore::new();
    let orch = orchestrator(
        &gateway,
        Arc::new(store.clone()),
        Arc::new(ContentArchive::in_memory()),
        CancellationToken::new(),
    );

    let params = RunParams {
        only_sold: true,
        fetch_details: true,
        ..Default::default()
    };
    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &params).await.unwrap();

    assert_eq!(report.stats.candidates, 10);
    assert_eq!(report.listings.len(), 5);
    assert!(report.listings.iter().all(|l| l.status == ListingStatus::Sold));
    assert_eq!(report.stats.detail_attempts, 5);
    assert!(!gateway.visits().contains(&listing_url(1)));
}

#[tokio::test(start_paused = true)]
async fn test_detail_phase_merges_and_prices_listings() {
    let bare = listing_url(2);
    let gateway = ScriptedGateway::new().search(SEARCH_URL, 0, 3).replies(
        &bare,
        vec![Reply::Html("<html><body><h1>1990 Porsche 911 Carrera 4</h1></body></html>".into())],
    );
    let store = MemoryListingStore::new();
    let archive = Arc::new(ContentArchive::in_memory());
    let orch = orchestrator(&gateway, Arc::new(store.clone()), archive.clone(), CancellationToken::new());

    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &with_details()).await.unwrap();

    assert_eq!(report.stats.detail_attempts, 3);
    assert_eq!(report.stats.detail_successes, 3);
    assert_eq!(report.stats.detail_failures, 0);
    assert!(!report.stats.circuit_tripped);
    assert!(report.unprocessed.is_empty());
    assert!(report.listings.iter().all(|l| l.detail_fetched));

    // Card said "bid to"; the detail page says sold, so the fee now applies
    let first = report.listings.iter().find(|l| l.url == listing_url(1)).unwrap();
    assert_eq!(first.status, ListingStatus::Sold);
    assert_eq!(first.price, Some(DETAIL_PRICE));
    let fee = first.buyer_fee.unwrap();
    assert_eq!(fee.fee, 3050);
    assert_eq!(fee.final_price, 64_050);
    assert_eq!(first.attributes.get("mileage").map(String::as_str), Some("42,100 miles"));

    // A detail page without a price keeps the card price
    let bare_listing = report.listings.iter().find(|l| l.url == bare).unwrap();
    assert_eq!(bare_listing.title, "1990 Porsche 911 Carrera 4");
    assert_eq!(bare_listing.price, Some(CARD_PRICE));
    assert_eq!(bare_listing.buyer_fee.map(|f| f.fee), Some(2500));

    // One search page plus three detail pages
    assert_eq!(report.stats.archive_writes, 4);
    let history = archive.history("bat", &listing_url(0)).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].artifact, ArtifactType::DetailPage);

    let stored = store.get("bat", &listing_url(1)).await.unwrap().unwrap();
    assert!(stored.detail_fetched);
    assert_eq!(gateway.opened(), gateway.closed());
}

#[tokio::test(start_paused = true)]
async fn test_transient_detail_failure_is_retried() {
    let url = listing_url(0);
    let gateway = ScriptedGateway::new()
        .search(SEARCH_URL, 0, 1)
        .replies(&url, vec![Reply::Status(503), Reply::Html(common::detail_html(0))]);
    let orch = orchestrator(
        &gateway,
        Arc::new(MemoryListingStore::new()),
        Arc::new(ContentArchive::in_memory()),
        CancellationToken::new(),
    );

    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &with_details()).await.unwrap();

    assert_eq!(report.stats.detail_successes, 1);
    assert_eq!(gateway.visits().iter().filter(|v| **v == url).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_trips_on_consecutive_detail_failures() {
    let mut gateway = ScriptedGateway::new().search(SEARCH_URL, 0, 12);
    for i in 0..12 {
        gateway = gateway.replies(&listing_url(i), vec![Reply::Status(500)]);
    }
    let store = MemoryListingStore::new();
    let orch = orchestrator(
        &gateway,
        Arc::new(store.clone()),
        Arc::new(ContentArchive::in_memory()),
        CancellationToken::new(),
    );

    // Low budget: breaker threshold 5
    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &with_details()).await.unwrap();

    assert!(report.stats.circuit_tripped);
    assert_eq!(report.stats.detail_attempts, 5);
    assert_eq!(report.stats.detail_failures, 5);
    assert!(report.listings.is_empty());
    assert_eq!(report.unprocessed.len(), 12);
    assert_eq!(report.stats.upserts, 0);
    assert!(store.is_empty().await);

    // Two attempts per failed item, nothing after the trip
    assert_eq!(gateway.visits().iter().filter(|v| **v == listing_url(4)).count(), 2);
    assert!(!gateway.visits().contains(&listing_url(5)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_target_does_not_abort_run() {
    let broken = "https://auctions.test/search?q=930";
    let gateway = ScriptedGateway::new()
        .search(SEARCH_URL, 100, 4)
        .replies(broken, vec![Reply::Status(503)]);
    let orch = orchestrator(
        &gateway,
        Arc::new(MemoryListingStore::new()),
        Arc::new(ContentArchive::in_memory()),
        CancellationToken::new(),
    );

    let source = source(vec![target("930-turbo", broken), target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &search_only()).await.unwrap();

    assert_eq!(report.stats.targets, 2);
    assert_eq!(report.stats.targets_failed, 1);
    assert_eq!(report.listings.len(), 4);
    // 503 is retryable: three attempts under the search policy
    assert_eq!(gateway.visits().iter().filter(|v| v.as_str() == broken).count(), 3);
    assert_eq!(gateway.opened(), gateway.closed());
}

#[tokio::test(start_paused = true)]
async fn test_missing_search_page_is_not_retried() {
    let missing = "https://auctions.test/search?q=914";
    let gateway = ScriptedGateway::new();
    let orch = orchestrator(
        &gateway,
        Arc::new(MemoryListingStore::new()),
        Arc::new(ContentArchive::in_memory()),
        CancellationToken::new(),
    );

    let source = source(vec![target("914", missing)]);
    let report = orch.run("bat", &source, &search_only()).await.unwrap();

    assert_eq!(report.stats.targets_failed, 1);
    assert_eq!(gateway.visits().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_preflight_failure_aborts_run() {
    let gateway = ScriptedGateway::new().search(SEARCH_URL, 0, 5).reject_credentials();
    let store = MemoryListingStore::new();
    let orch = orchestrator(
        &gateway,
        Arc::new(store.clone()),
        Arc::new(ContentArchive::in_memory()),
        CancellationToken::new(),
    );

    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let err = orch.run("bat", &source, &search_only()).await.unwrap_err();

    assert!(matches!(err, ScrapeError::Connectivity(_)));
    assert_eq!(gateway.opened(), 0);
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_transient_check_failure_is_retried() {
    let gateway = ScriptedGateway::new().search(SEARCH_URL, 0, 5).check_failures(vec![503]);
    let store = MemoryListingStore::new();
    let orch = orchestrator(
        &gateway,
        Arc::new(store.clone()),
        Arc::new(ContentArchive::in_memory()),
        CancellationToken::new(),
    );

    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &search_only()).await.unwrap();

    assert_eq!(gateway.checks(), 2);
    assert_eq!(report.listings.len(), 5);
    assert_eq!(store.len().await, 5);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_check_failure_aborts_after_retries() {
    let gateway = ScriptedGateway::new()
        .search(SEARCH_URL, 0, 5)
        .check_failures(vec![503, 502, 504, 503]);
    let orch = orchestrator(
        &gateway,
        Arc::new(MemoryListingStore::new()),
        Arc::new(ContentArchive::in_memory()),
        CancellationToken::new(),
    );

    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let err = orch.run("bat", &source, &search_only()).await.unwrap_err();

    assert!(matches!(err, ScrapeError::Connectivity(_)));
    assert_eq!(gateway.checks(), 3);
    assert_eq!(gateway.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_selection_returns_empty_report() {
    let gateway = ScriptedGateway::new().reject_credentials();
    let orch = orchestrator(
        &gateway,
        Arc::new(MemoryListingStore::new()),
        Arc::new(ContentArchive::in_memory()),
        CancellationToken::new(),
    );

    let params = RunParams {
        model: Some("cayenne".into()),
        ..Default::default()
    };
    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &params).await.unwrap();

    assert_eq!(report.stats.targets, 0);
    assert!(report.listings.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_returns_partial_report() {
    let gateway = ScriptedGateway::new().search(SEARCH_URL, 0, 5);
    let cancel = CancellationToken::new();
    let orch = orchestrator(
        &gateway,
        Arc::new(MemoryListingStore::new()),
        Arc::new(ContentArchive::in_memory()),
        cancel.clone(),
    );
    cancel.cancel();

    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &with_details()).await.unwrap();

    assert!(report.stats.cancelled);
    assert_eq!(report.stats.targets, 0);
    assert_eq!(report.stats.detail_attempts, 0);
    assert!(report.listings.is_empty());
    assert_eq!(gateway.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_archive_rejection_counts_as_detail_failure() {
    let gateway = ScriptedGateway::new().search(SEARCH_URL, 0, 3);
    let tiny = BucketPolicy {
        max_object_size: 16,
        ..Default::default()
    };
    let archive = ContentArchive::new(
        Arc::new(MemoryBlobStore::new(tiny)),
        Arc::new(MemoryLedger::new()),
        30,
    );
    let store = MemoryListingStore::new();
    let orch = orchestrator(&gateway, Arc::new(store.clone()), Arc::new(archive), CancellationToken::new());

    let source = source(vec![target("911-carrera", SEARCH_URL)]);
    let report = orch.run("bat", &source, &with_details()).await.unwrap();

    // The search page is still extracted when its archive write fails
    assert_eq!(report.stats.candidates, 3);
    assert_eq!(report.stats.archive_writes, 0);
    assert_eq!(report.stats.archive_failures, 4);
    assert_eq!(report.stats.detail_failures, 3);
    assert!(!report.stats.circuit_tripped);
    assert!(report.listings.is_empty());
    assert_eq!(report.unprocessed.len(), 3);
    assert!(store.is_empty().await);
}
