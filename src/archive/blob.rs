//! Blob storage backends for archived artifacts.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::ScrapeError;

/// Default maximum object size: 50 MiB.
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("content type not allowed: {0}")]
    ContentTypeNotAllowed(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl From<BlobError> for ScrapeError {
    fn from(e: BlobError) -> Self {
        ScrapeError::Persistence(e.to_string())
    }
}

/// Limits enforced on every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketPolicy {
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
    #[serde(default = "default_allowed_types")]
    pub allowed_content_types: Vec<String>,
}

fn default_max_object_size() -> u64 {
    DEFAULT_MAX_OBJECT_SIZE
}

fn default_allowed_types() -> Vec<String> {
    vec![
        "text/html".to_string(),
        "application/json".to_string(),
        "image/png".to_string(),
    ]
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            max_object_size: default_max_object_size(),
            allowed_content_types: default_allowed_types(),
        }
    }
}

impl BucketPolicy {
    pub fn check(&self, size: u64, content_type: &str) -> Result<(), BlobError> {
        if size > self.max_object_size {
            return Err(BlobError::TooLarge {
                size,
                max: self.max_object_size,
            });
        }
        let base_type = content_type.split(';').next().unwrap_or_default().trim();
        if !self.allowed_content_types.iter().any(|t| t == base_type) {
            return Err(BlobError::ContentTypeNotAllowed(content_type.to_string()));
        }
        Ok(())
    }
}

/// Keys are relative, `/`-separated and never escape the bucket.
fn validate_key(key: &str) -> Result<(), BlobError> {
    let path = Path::new(key);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if key.is_empty() || escapes {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write an object, replacing any previous object at `key`.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Remove an object. Returns false if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool, BlobError>;
}

/// Blobs as files under a root directory.
pub struct FsBlobStore {
    root: PathBuf,
    policy: BucketPolicy,
}

impl FsBlobStore {
    /// Create the bucket root if needed.
    pub async fn provision(root: impl Into<PathBuf>, policy: BucketPolicy) -> Result<Self, BlobError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        info!("Archive bucket ready at {}", root.display());
        Ok(Self { root, policy })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), BlobError> {
        self.policy.check(bytes.len() as u64, content_type)?;
        let path = self.full_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never see a partial object
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("Stored {} bytes at {}", bytes.len(), path.display());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let path = self.full_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.full_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory blob store.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    policy: BucketPolicy,
}

impl MemoryBlobStore {
    pub fn new(policy: BucketPolicy) -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), BlobError> {
        self.policy.check(bytes.len() as u64, content_type)?;
        validate_key(key)?;
        self.objects.write().await.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        Ok(self.objects.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_policy_limits() {
        let policy = BucketPolicy {
            max_object_size: 10,
            ..Default::default()
        };
        assert!(policy.check(10, "text/html; charset=utf-8").is_ok());
        assert!(matches!(policy.check(11, "text/html"), Err(BlobError::TooLarge { .. })));
        assert!(matches!(
            policy.check(1, "application/pdf"),
            Err(BlobError::ContentTypeNotAllowed(_))
        ));
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("src/20240101/x.html").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("").is_err());
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip_and_overwrite() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::provision(dir.path().join("bucket"), BucketPolicy::default())
            .await
            .unwrap();
        let key = "bat/20240101/911/base/search_page/search_abc.html";

        store.put(key, b"<html>one</html>", "text/html").await.unwrap();
        store.put(key, b"<html>two</html>", "text/html").await.unwrap();
        assert_eq!(store.get(key).await.unwrap().unwrap(), b"<html>two</html>");

        assert!(store.delete(key).await.unwrap());
        assert!(!store.delete(key).await.unwrap());
        assert_eq!(store.get(key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_disallowed_type() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::provision(dir.path(), BucketPolicy::default()).await.unwrap();
        let result = store.put("a/b.bin", b"data", "application/octet-stream").await;
        assert!(matches!(result, Err(BlobError::ContentTypeNotAllowed(_))));
        assert_eq!(store.get("a/b.bin").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBlobStore::default();
        store.put("k/1.json", b"{}", "application/json").await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("k/1.json").await.unwrap().as_deref(), Some(&b"{}"[..]));
        assert!(store.delete("k/1.json").await.unwrap());
        assert!(store.is_empty().await);
    }
}
