//! The scrape command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use lotacquire::config::Config;
use lotacquire::gateway::build_gateway;
use lotacquire::models::RunParams;
use lotacquire::orchestrator::{RunReport, ScrapeOrchestrator};
use lotacquire::store::SqliteListingStore;

use super::open_archive;
use crate::cli::helpers::{format_price, truncate};

/// Scrape one source. Ctrl-C stops the run and keeps what was collected.
pub async fn cmd_run(config: &Config, source_id: &str, params: &RunParams, json: bool) -> anyhow::Result<()> {
    let source = config.source(source_id)?;
    let settings = config.settings();

    let archive = open_archive(config, &settings).await?;
    let store = SqliteListingStore::open(&settings.database_path())
        .with_context(|| format!("failed to open {}", settings.database_path().display()))?;
    let gateway = build_gateway(&config.gateway)?;

    let cancel = CancellationToken::new();
    let orchestrator = ScrapeOrchestrator::from_config(
        config,
        gateway,
        Arc::new(store),
        Arc::new(archive),
        cancel.clone(),
    )?;

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} Interrupted, finishing the current step", style("!").yellow());
                cancel.cancel();
            }
        }
    });

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(format!("Scraping {}...", source.display_name(source_id)));
    pb.enable_steady_tick(Duration::from_millis(120));

    let result = orchestrator.run(source_id, source, params).await;
    pb.finish_and_clear();
    let report = result.with_context(|| format!("run for {} failed", source_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let stats = &report.stats;

    println!("\n{} {}", style("Run report for").bold(), style(&report.source).cyan());
    println!("{}", "-".repeat(80));
    for listing in &report.listings {
        let settled = listing.buyer_fee.map(|fee| fee.final_price);
        println!(
            "{:<8} {:>12} {:>12}  {}",
            listing.status.as_str(),
            format_price(listing.price),
            format_price(settled),
            truncate(&listing.title, 44)
        );
    }
    println!("{}", "-".repeat(80));

    println!(
        "Targets:   {} searched, {} failed",
        stats.targets, stats.targets_failed
    );
    println!(
        "Listings:  {} found, {} already known, {} new",
        stats.candidates,
        stats.known,
        report.listings.len()
    );
    if stats.detail_attempts > 0 || !report.unprocessed.is_empty() {
        println!(
            "Details:   {} fetched, {} failed, {} left unprocessed",
            stats.detail_successes,
            stats.detail_failures,
            report.unprocessed.len()
        );
    }
    println!(
        "Archive:   {} written, {} failed",
        stats.archive_writes, stats.archive_failures
    );
    println!(
        "Stored:    {} listings, {} failed",
        stats.upserts, stats.upsert_failures
    );

    if stats.circuit_tripped {
        println!(
            "{} Circuit breaker tripped; remaining details were skipped",
            style("!").yellow()
        );
    }
    if stats.cancelled {
        println!("{} Run cancelled; partial results kept", style("!").yellow());
    }
}
