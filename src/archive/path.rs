//! Deterministic archive paths and hashing helpers.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::models::ArtifactType;

/// Longest URL slug kept in a filename.
const MAX_URL_SLUG: usize = 60;

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Listing-scoped key: `{source}:{first 16 hex of sha256(url)}`.
pub fn lookup_key(source: &str, url: &str) -> String {
    format!("{}:{}", source, &sha256_hex(url.as_bytes())[..16])
}

/// Lowercase ASCII alphanumerics separated by single dashes.
pub fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Slug of the last path segment of `url`, or `index`.
pub fn url_slug(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    let mut slug = slugify(last);
    if slug.len() > MAX_URL_SLUG {
        slug.truncate(MAX_URL_SLUG);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        "index".to_string()
    } else {
        slug
    }
}

/// Everything that determines where an artifact is stored.
#[derive(Debug, Clone, Copy)]
pub struct PathParts<'a> {
    pub source: &'a str,
    pub date: NaiveDate,
    pub model: Option<&'a str>,
    pub trim: Option<&'a str>,
    pub generation: Option<&'a str>,
    pub artifact: ArtifactType,
    pub url: &'a str,
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(slugify).filter(|s| !s.is_empty())
}

/// Trim/generation directory: `trim-gen`, `trim` or `gen-<gen>`. Omitted
/// when neither is known.
fn variant_segment(trim: Option<&str>, generation: Option<&str>) -> Option<String> {
    match (non_empty(trim), non_empty(generation)) {
        (Some(t), Some(g)) => Some(format!("{}-{}", t, g)),
        (Some(t), None) => Some(t),
        (None, Some(g)) => Some(format!("gen-{}", g)),
        (None, None) => None,
    }
}

/// Relative blob key:
/// `source/YYYYMMDD/model[/variant]/artifact/urlslug_hash12.ext`.
pub fn archive_path(parts: &PathParts<'_>) -> String {
    let hash = sha256_hex(parts.url.as_bytes());
    let model = non_empty(parts.model).unwrap_or_else(|| "unknown".to_string());
    let partition = match variant_segment(parts.trim, parts.generation) {
        Some(variant) => format!("{}/{}", model, variant),
        None => model,
    };
    format!(
        "{}/{}/{}/{}/{}_{}.{}",
        slugify(parts.source),
        parts.date.format("%Y%m%d"),
        partition,
        parts.artifact.as_str(),
        url_slug(parts.url),
        &hash[..12],
        parts.artifact.extension()
    )
}
