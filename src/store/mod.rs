//! Persisted listings.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::error::ScrapeError;
use crate::models::{CandidateListing, ListingStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Other(String),
}

impl From<StoreError> for ScrapeError {
    fn from(e: StoreError) -> Self {
        ScrapeError::Persistence(e.to_string())
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// URLs already persisted for `source`.
    async fn existing_urls(&self, source: &str) -> Result<HashSet<String>, StoreError>;

    async fn upsert(&self, source: &str, listing: &CandidateListing) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, source: &str, url: &str) -> Result<Option<CandidateListing>, StoreError>;
}

/// In-memory listing store.
#[derive(Clone, Default)]
pub struct MemoryListingStore {
    listings: Arc<RwLock<HashMap<(String, String), CandidateListing>>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate `source` with `urls`, as if scraped earlier.
    pub async fn seed(&self, source: &str, urls: impl IntoIterator<Item = String>) {
        let mut listings = self.listings.write().await;
        for url in urls {
            let listing = CandidateListing::new(url.clone(), "", crate::models::ExtractionStrategy::RenderedCard);
            listings.insert((source.to_string(), url), listing);
        }
    }

    pub async fn len(&self) -> usize {
        self.listings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listings.read().await.is_empty()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn existing_urls(&self, source: &str) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .listings
            .read()
            .await
            .keys()
            .filter(|(s, _)| s == source)
            .map(|(_, url)| url.clone())
            .collect())
    }

    async fn upsert(&self, source: &str, listing: &CandidateListing) -> Result<UpsertOutcome, StoreError> {
        let previous = self
            .listings
            .write()
            .await
            .insert((source.to_string(), listing.url.clone()), listing.clone());
        Ok(if previous.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn get(&self, source: &str, url: &str) -> Result<Option<CandidateListing>, StoreError> {
        Ok(self
            .listings
            .read()
            .await
            .get(&(source.to_string(), url.to_string()))
            .cloned())
    }
}

/// SQLite-backed listing store.
pub struct SqliteListingStore {
    conn: Mutex<Connection>,
}

impl SqliteListingStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Other(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                source TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                price INTEGER,
                status TEXT NOT NULL,
                target_slug TEXT,
                data TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (source, url)
            );

            CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(source, status);
        "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Count of listings for `source` with `status`.
    pub async fn count_by_status(&self, source: &str, status: ListingStatus) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM listings WHERE source = ?1 AND status = ?2",
            params![source, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ListingStore for SqliteListingStore {
    async fn existing_urls(&self, source: &str) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT url FROM listings WHERE source = ?1")?;
        let urls = stmt.query_map(params![source], |row| row.get::<_, String>(0))?;
        Ok(urls.collect::<rusqlite::Result<HashSet<_>>>()?)
    }

    async fn upsert(&self, source: &str, listing: &CandidateListing) -> Result<UpsertOutcome, StoreError> {
        let data = serde_json::to_string(listing)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM listings WHERE source = ?1 AND url = ?2)",
            params![source, listing.url],
            |row| row.get(0),
        )?;
        conn.execute(
            r#"INSERT INTO listings (source, url, title, price, status, target_slug, data, first_seen, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
               ON CONFLICT(source, url) DO UPDATE SET
                   title = excluded.title,
                   price = excluded.price,
                   status = excluded.status,
                   target_slug = excluded.target_slug,
                   data = excluded.data,
                   updated_at = excluded.updated_at"#,
            params![
                source,
                listing.url,
                listing.title,
                listing.price.and_then(|p| i64::try_from(p).ok()),
                listing.status.as_str(),
                listing.target_slug,
                data,
                now,
            ],
        )?;
        Ok(if exists {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn get(&self, source: &str, url: &str) -> Result<Option<CandidateListing>, StoreError> {
        let conn = self.conn.lock().await;
        let data: Option<String> = match conn.query_row(
            "SELECT data FROM listings WHERE source = ?1 AND url = ?2",
            params![source, url],
            |row| row.get(0),
        ) {
            Ok(data) => Some(data),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        data.map(|d| serde_json::from_str(&d).map_err(StoreError::from))
            .transpose()
    }
}
