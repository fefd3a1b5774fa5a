//! Append-only archive metadata ledger.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use tokio::sync::{Mutex, RwLock};

use super::ArchiveError;
use crate::models::{ArchiveEntry, ArtifactType};

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn insert(&self, entry: &ArchiveEntry) -> Result<(), ArchiveError>;

    /// Rows whose expiry is at or before `now`.
    async fn query_expired(&self, now: DateTime<Utc>) -> Result<Vec<ArchiveEntry>, ArchiveError>;

    /// Delete rows by id. Returns the number removed.
    async fn delete(&self, ids: &[String]) -> Result<usize, ArchiveError>;

    /// Rows for a lookup key, newest first.
    async fn find_by_lookup_key(&self, key: &str) -> Result<Vec<ArchiveEntry>, ArchiveError>;

    /// Whether any unexpired row still references `path`.
    async fn path_in_use(&self, path: &str, now: DateTime<Utc>) -> Result<bool, ArchiveError>;
}

/// In-memory ledger.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    rows: Arc<RwLock<Vec<ArchiveEntry>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert(&self, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
        self.rows.write().await.push(entry.clone());
        Ok(())
    }

    async fn query_expired(&self, now: DateTime<Utc>) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|e| e.is_expired(now))
            .cloned()
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, ArchiveError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|e| !ids.contains(&e.id));
        Ok(before - rows.len())
    }

    async fn find_by_lookup_key(&self, key: &str) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let rows = self.rows.read().await;
        // Insertion order breaks ties between equal timestamps
        let mut found: Vec<(usize, ArchiveEntry)> = rows
            .iter()
            .enumerate()
            .filter(|(_, e)| e.lookup_key == key)
            .map(|(i, e)| (i, e.clone()))
            .collect();
        found.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at).then(b.0.cmp(&a.0)));
        Ok(found.into_iter().map(|(_, e)| e).collect())
    }

    async fn path_in_use(&self, path: &str, now: DateTime<Utc>) -> Result<bool, ArchiveError> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .any(|e| e.path == path && !e.is_expired(now)))
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    // Fixed-width UTC so text comparison matches time order
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ArchiveEntry> {
    Ok(ArchiveEntry {
        id: row.get("id")?,
        source: row.get("source")?,
        url: row.get("url")?,
        artifact: ArtifactType::from_str(&row.get::<_, String>("artifact")?)
            .unwrap_or(ArtifactType::SearchPage),
        path: row.get("path")?,
        content_hash: row.get("content_hash")?,
        byte_size: row.get::<_, i64>("byte_size")?.max(0) as u64,
        lookup_key: row.get("lookup_key")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        expires_at: parse_datetime(&row.get::<_, String>("expires_at")?),
        metadata: serde_json::from_str(&row.get::<_, String>("metadata")?).unwrap_or_default(),
    })
}

/// SQLite-backed ledger.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(db_path: &Path) -> Result<Self, ArchiveError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ArchiveError::Ledger(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, ArchiveError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, ArchiveError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS archive_entries (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                url TEXT NOT NULL,
                artifact TEXT NOT NULL,
                path TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                lookup_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                metadata TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_archive_lookup ON archive_entries(lookup_key);
            CREATE INDEX IF NOT EXISTS idx_archive_expires ON archive_entries(expires_at);
            CREATE INDEX IF NOT EXISTS idx_archive_path ON archive_entries(path);
        "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn insert(&self, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO archive_entries
               (id, source, url, artifact, path, content_hash, byte_size, lookup_key, created_at, expires_at, metadata)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                entry.id,
                entry.source,
                entry.url,
                entry.artifact.as_str(),
                entry.path,
                entry.content_hash,
                entry.byte_size as i64,
                entry.lookup_key,
                format_datetime(&entry.created_at),
                format_datetime(&entry.expires_at),
                entry.metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    async fn query_expired(&self, now: DateTime<Utc>) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM archive_entries WHERE expires_at <= ?1 ORDER BY expires_at")?;
        let rows = stmt.query_map(params![format_datetime(&now)], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, ArchiveError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM archive_entries WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    async fn find_by_lookup_key(&self, key: &str) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM archive_entries WHERE lookup_key = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![key], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn path_in_use(&self, path: &str, now: DateTime<Utc>) -> Result<bool, ArchiveError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM archive_entries WHERE path = ?1 AND expires_at > ?2",
            params![path, format_datetime(&now)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
