//! Archive ledger models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of raw artifact written to the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    SearchPage,
    DetailPage,
    ApiResponse,
    Screenshot,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchPage => "search_page",
            Self::DetailPage => "detail_page",
            Self::ApiResponse => "api_response",
            Self::Screenshot => "screenshot",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "search_page" => Some(Self::SearchPage),
            "detail_page" => Some(Self::DetailPage),
            "api_response" => Some(Self::ApiResponse),
            "screenshot" => Some(Self::Screenshot),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::SearchPage | Self::DetailPage => "html",
            Self::ApiResponse => "json",
            Self::Screenshot => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::SearchPage | Self::DetailPage => "text/html",
            Self::ApiResponse => "application/json",
            Self::Screenshot => "image/png",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One ledger row. A row is inserted for every store call, even when the
/// content is byte-identical to an earlier row at the same path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: String,
    pub source: String,
    pub url: String,
    pub artifact: ArtifactType,
    /// Blob path relative to the store root.
    pub path: String,
    /// SHA-256 of the full content, hex encoded.
    pub content_hash: String,
    pub byte_size: u64,
    /// Listing-scoped key used for retrieval.
    pub lookup_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl ArchiveEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_round_trip_names() {
        for artifact in [
            ArtifactType::SearchPage,
            ArtifactType::DetailPage,
            ArtifactType::ApiResponse,
            ArtifactType::Screenshot,
        ] {
            assert_eq!(ArtifactType::from_str(artifact.as_str()), Some(artifact));
        }
    }

    #[test]
    fn test_artifact_extension() {
        assert_eq!(ArtifactType::SearchPage.extension(), "html");
        assert_eq!(ArtifactType::ApiResponse.extension(), "json");
        assert_eq!(ArtifactType::Screenshot.content_type(), "image/png");
    }
}
