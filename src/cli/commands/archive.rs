//! Archive maintenance.

use console::style;

use lotacquire::config::Config;

use super::open_archive;

/// Delete expired archive rows and unreferenced blobs.
pub async fn cmd_cleanup(config: &Config) -> anyhow::Result<()> {
    let settings = config.settings();
    let archive = open_archive(config, &settings).await?;
    let report = archive.cleanup().await?;

    println!(
        "{} Removed {} expired entries and {} blobs",
        style("✓").green(),
        report.rows_deleted,
        report.blobs_deleted
    );
    if report.blobs_retained > 0 {
        println!(
            "  {} blobs kept (still referenced by newer entries)",
            report.blobs_retained
        );
    }
    if report.blob_errors > 0 {
        println!(
            "{} {} blobs could not be deleted",
            style("!").yellow(),
            report.blob_errors
        );
    }
    Ok(())
}
