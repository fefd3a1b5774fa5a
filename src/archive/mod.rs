//! Content archive: every fetched artifact is written to blob storage and
//! recorded in the ledger before it is parsed.
//!
//! Blob paths are derived from metadata (see [`path::archive_path`]), so a
//! refetch of the same URL on the same day overwrites the blob while the
//! ledger gains a new row.

mod blob;
mod ledger;
pub mod path;

pub use blob::{BlobError, BlobStore, BucketPolicy, FsBlobStore, MemoryBlobStore, DEFAULT_MAX_OBJECT_SIZE};
pub use ledger::{Ledger, MemoryLedger, SqliteLedger};

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::ScrapeError;
use crate::models::{ArchiveEntry, ArtifactType, ScrapeTarget};
use path::{archive_path, lookup_key, sha256_hex, PathParts};

/// Default retention for archived artifacts.
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl From<ArchiveError> for ScrapeError {
    fn from(e: ArchiveError) -> Self {
        ScrapeError::Persistence(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default)]
    pub bucket: BucketPolicy,
}

fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            bucket: BucketPolicy::default(),
        }
    }
}

/// One artifact to archive.
#[derive(Debug, Clone)]
pub struct ArchiveRequest<'a> {
    pub source: &'a str,
    pub url: &'a str,
    pub artifact: ArtifactType,
    pub content: &'a [u8],
    pub model: Option<&'a str>,
    pub trim: Option<&'a str>,
    pub generation: Option<&'a str>,
    pub metadata: serde_json::Value,
}

impl<'a> ArchiveRequest<'a> {
    pub fn new(source: &'a str, url: &'a str, artifact: ArtifactType, content: &'a [u8]) -> Self {
        Self {
            source,
            url,
            artifact,
            content,
            model: None,
            trim: None,
            generation: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    /// Partition by the target's model, trim and generation.
    pub fn for_target(mut self, target: &'a ScrapeTarget) -> Self {
        self.model = Some(&target.model);
        self.trim = target.trim.as_deref();
        self.generation = target.generation.as_deref();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub rows_deleted: usize,
    pub blobs_deleted: usize,
    /// Expired paths still referenced by a newer row.
    pub blobs_retained: usize,
    pub blob_errors: usize,
}

pub struct ContentArchive {
    blobs: Arc<dyn BlobStore>,
    ledger: Arc<dyn Ledger>,
    retention: chrono::Duration,
}

impl ContentArchive {
    pub fn new(blobs: Arc<dyn BlobStore>, ledger: Arc<dyn Ledger>, retention_days: i64) -> Self {
        Self {
            blobs,
            ledger,
            retention: chrono::Duration::days(retention_days.max(0)),
        }
    }

    /// In-memory archive.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBlobStore::default()),
            Arc::new(MemoryLedger::new()),
            DEFAULT_RETENTION_DAYS,
        )
    }

    pub async fn store(&self, request: ArchiveRequest<'_>) -> Result<ArchiveEntry, ArchiveError> {
        self.store_at(request, Utc::now()).await
    }

    /// Write the blob and append a ledger row, as of `now`.
    pub async fn store_at(&self, request: ArchiveRequest<'_>, now: DateTime<Utc>) -> Result<ArchiveEntry, ArchiveError> {
        let path = archive_path(&PathParts {
            source: request.source,
            date: now.date_naive(),
            model: request.model,
            trim: request.trim,
            generation: request.generation,
            artifact: request.artifact,
            url: request.url,
        });

        self.blobs
            .put(&path, request.content, request.artifact.content_type())
            .await?;

        let entry = ArchiveEntry {
            id: uuid::Uuid::new_v4().to_string(),
            source: request.source.to_string(),
            url: request.url.to_string(),
            artifact: request.artifact,
            path,
            content_hash: sha256_hex(request.content),
            byte_size: request.content.len() as u64,
            lookup_key: lookup_key(request.source, request.url),
            created_at: now,
            expires_at: now + self.retention,
            metadata: request.metadata,
        };
        self.ledger.insert(&entry).await?;
        debug!(
            "Archived {} ({} bytes) at {}",
            entry.url, entry.byte_size, entry.path
        );
        Ok(entry)
    }

    /// All rows for a listing, newest first.
    pub async fn history(&self, source: &str, url: &str) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        self.ledger.find_by_lookup_key(&lookup_key(source, url)).await
    }

    /// Newest entry for a listing with its content.
    pub async fn latest(&self, source: &str, url: &str) -> Result<Option<(ArchiveEntry, Vec<u8>)>, ArchiveError> {
        for entry in self.history(source, url).await? {
            if let Some(bytes) = self.blobs.get(&entry.path).await? {
                return Ok(Some((entry, bytes)));
            }
        }
        Ok(None)
    }

    pub async fn cleanup(&self) -> Result<CleanupReport, ArchiveError> {
        self.cleanup_at(Utc::now()).await
    }

    /// Delete expired rows, then the blobs no live row references.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupReport, ArchiveError> {
        let expired = self.ledger.query_expired(now).await?;
        let ids: Vec<String> = expired.iter().map(|e| e.id.clone()).collect();
        let paths: BTreeSet<String> = expired.into_iter().map(|e| e.path).collect();

        let mut report = CleanupReport {
            rows_deleted: self.ledger.delete(&ids).await?,
            ..Default::default()
        };

        for path in paths {
            if self.ledger.path_in_use(&path, now).await? {
                report.blobs_retained += 1;
                continue;
            }
            match self.blobs.delete(&path).await {
                Ok(true) => report.blobs_deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to delete archived blob {}: {}", path, e);
                    report.blob_errors += 1;
                }
            }
        }

        info!(
            "Archive cleanup: {} rows, {} blobs deleted, {} blobs retained",
            report.rows_deleted, report.blobs_deleted, report.blobs_retained
        );
        Ok(report)
    }
}
