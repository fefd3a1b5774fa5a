//! Configuration management for lotacquire using the prefer crate.

mod source;

pub use source::{Delays, SourceBudget, SourceConfig};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::archive::ArchiveConfig;
use crate::error::{ScrapeError, ScrapeResult};
use crate::gateway::GatewayConfig;
use crate::pagination::PaginationConfig;
use crate::retry::RetryPolicy;
use crate::session::{profile_by_name, FingerprintProfile, SessionLimits};

/// Default database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "lotacquire.db";

/// Archive bucket subdirectory of the data directory.
const ARCHIVE_SUBDIR: &str = "archive";

/// Resolved filesystem locations.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub database_filename: String,
    pub archive_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lotacquire");
        Self::with_data_dir(data_dir)
    }
}

impl Settings {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            archive_dir: data_dir.join(ARCHIVE_SUBDIR),
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
        }
    }

    /// Full path to the SQLite database. Absolute filenames are kept as-is.
    pub fn database_path(&self) -> PathBuf {
        let db = Path::new(&self.database_filename);
        if db.is_absolute() {
            db.to_path_buf()
        } else {
            self.data_dir.join(db)
        }
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.archive_dir)?;
        Ok(())
    }
}

/// Egress pool and identity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_zones")]
    pub zones: Vec<String>,
    #[serde(flatten)]
    pub limits: SessionLimits,
    /// `stealth` or `none`.
    #[serde(default = "default_fingerprint")]
    pub fingerprint: String,
}

fn default_zones() -> Vec<String> {
    ["us", "ca", "gb", "de"].iter().map(|z| z.to_string()).collect()
}

fn default_fingerprint() -> String {
    "stealth".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            zones: default_zones(),
            limits: SessionLimits::default(),
            fingerprint: default_fingerprint(),
        }
    }
}

impl SessionConfig {
    pub fn profile(&self) -> Box<dyn FingerprintProfile> {
        profile_by_name(&self.fingerprint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryPolicy::search")]
    pub search: RetryPolicy,
    #[serde(default = "RetryPolicy::detail")]
    pub detail: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            search: RetryPolicy::search(),
            detail: RetryPolicy::detail(),
        }
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Database filename, relative to the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Archive bucket directory; defaults to `<data_dir>/archive`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<String>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    /// Path to the config file this was loaded from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Discover a `lotacquire` config file in the standard locations.
    /// Falls back to defaults when none is found or it fails to parse.
    pub async fn load() -> Self {
        match prefer::load("lotacquire").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => match Self::load_from_path(path).await {
                    Ok(config) => config,
                    Err(e) => {
                        warn!("Ignoring config at {}: {}", path.display(), e);
                        Self::default_with_env()
                    }
                },
                None => Self::default_with_env(),
            },
            Err(e) => {
                debug!("No config file found: {}", e);
                Self::default_with_env()
            }
        }
    }

    pub fn default_with_env() -> Self {
        let mut config = Self::default();
        config.gateway = config.gateway.with_env_overrides();
        config
    }

    /// Load a specific file. Format is chosen by extension: TOML, YAML,
    /// otherwise JSON.
    pub async fn load_from_path(path: &Path) -> ScrapeResult<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ScrapeError::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let mut config = Self::parse(&contents, ext)?;
        config.source_path = Some(path.to_path_buf());
        config.gateway = config.gateway.with_env_overrides();
        Ok(config)
    }

    /// Parse config text in the format named by `ext`.
    pub fn parse(contents: &str, ext: &str) -> ScrapeResult<Self> {
        let config: Config = match ext {
            "toml" => toml::from_str(contents)
                .map_err(|e| ScrapeError::Config(format!("failed to parse TOML config: {}", e)))?,
            "yaml" | "yml" => serde_yaml::from_str(contents)
                .map_err(|e| ScrapeError::Config(format!("failed to parse YAML config: {}", e)))?,
            _ => serde_json::from_str(contents)
                .map_err(|e| ScrapeError::Config(format!("failed to parse JSON config: {}", e)))?,
        };
        for (key, source) in &config.sources {
            source.validate(key)?;
        }
        Ok(config)
    }

    /// Directory of the config file, if loaded from one.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Expand `~` and resolve relative paths against `base_dir`.
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Resolve filesystem settings. Relative paths are taken from the config
    /// file's directory, or the working directory.
    pub fn settings(&self) -> Settings {
        let base_dir = self
            .base_dir()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut settings = match self.data_dir {
            Some(ref dir) => Settings::with_data_dir(self.resolve_path(dir, &base_dir)),
            None => Settings::default(),
        };
        if let Some(ref database) = self.database {
            settings.database_filename = shellexpand::tilde(database).into_owned();
        }
        if let Some(ref archive_dir) = self.archive_dir {
            settings.archive_dir = self.resolve_path(archive_dir, &base_dir);
        }
        settings
    }

    pub fn source(&self, key: &str) -> ScrapeResult<&SourceConfig> {
        self.sources.get(key).ok_or_else(|| {
            let known: Vec<&str> = self.sources.keys().map(String::as_str).collect();
            ScrapeError::Config(format!(
                "unknown source {:?} (configured: {})",
                key,
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            ))
        })
    }
}
