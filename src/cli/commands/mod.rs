//! Command implementations.

mod archive;
mod run;
mod source;

pub use archive::cmd_cleanup;
pub use run::cmd_run;
pub use source::{cmd_sources, cmd_targets};

use std::sync::Arc;

use anyhow::Context;

use lotacquire::archive::{ContentArchive, FsBlobStore, SqliteLedger};
use lotacquire::config::{Config, Settings};

/// Open the on-disk archive: blob bucket under the archive dir, ledger in
/// the database.
async fn open_archive(config: &Config, settings: &Settings) -> anyhow::Result<ContentArchive> {
    settings
        .ensure_directories()
        .with_context(|| format!("failed to create {}", settings.data_dir.display()))?;
    let blobs = FsBlobStore::provision(&settings.archive_dir, config.archive.bucket.clone())
        .await
        .context("failed to provision archive bucket")?;
    let ledger = SqliteLedger::open(&settings.database_path()).context("failed to open archive ledger")?;
    Ok(ContentArchive::new(
        Arc::new(blobs),
        Arc::new(ledger),
        config.archive.retention_days,
    ))
}
