//! Configuration for the memory system
//!
//! Every section is optional in the TOML file; missing values fall back to
//! the defaults below. Environment variables override the file.

use crate::{CcaError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default global token budget for a single retrieval
pub const DEFAULT_TARGET_TOKENS: usize = 100_000;

/// Storage directory, relative to the repository root
pub const DEFAULT_STORAGE_DIR: &str = ".beads/memory";

/// Per-repository config file name
pub const REPO_CONFIG_FILE: &str = ".confucius.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Path to the repository root
    #[serde(default = "default_repository")]
    pub repository: PathBuf,

    /// Submodules to track; one scope is created per name
    #[serde(default)]
    pub submodules: Vec<String>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub beads: BeadsConfig,
}

fn default_repository() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Filesystem,
    Database,
}

impl StorageBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Database => "database",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,
    /// Relative paths are resolved against the repository root
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Advisory size ceiling in MB
    #[serde(default)]
    pub max_size_mb: Option<u64>,
    /// Records older than this many days are removed by `purge_expired`
    #[serde(default)]
    pub retention_days: Option<u64>,
}

fn default_backend() -> StorageBackendKind {
    StorageBackendKind::Filesystem
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_DIR)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_storage_path(),
            max_size_mb: Some(1000),
            retention_days: Some(90),
        }
    }
}

/// Share of the global target given to each scope level.
///
/// Informational weighting only; the compression engine enforces the
/// global target, not these fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopeBudgets {
    pub repository: f64,
    pub submodule: f64,
    pub session: f64,
    pub task: f64,
}

impl Default for ScopeBudgets {
    fn default() -> Self {
        Self {
            repository: 0.1,
            submodule: 0.3,
            session: 0.3,
            task: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    /// Advisory, in `[0, 1]`
    #[serde(default = "default_compression_level")]
    pub compression_level: f64,
    #[serde(default)]
    pub scope_budgets: ScopeBudgets,
}

fn default_target_tokens() -> usize {
    DEFAULT_TARGET_TOKENS
}

fn default_compression_level() -> f64 {
    0.5
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            compression_level: default_compression_level(),
            scope_budgets: ScopeBudgets::default(),
        }
    }
}

/// Issue-tracker (Beads) feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeadsConfig {
    /// Directory `bd` runs in; defaults to the repository root
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub auto_create_task_scopes: bool,
    #[serde(default = "default_true")]
    pub auto_generate_notes: bool,
    /// Poll for closed issues and store notes automatically
    #[serde(default)]
    pub auto_learning: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    60
}

impl Default for BeadsConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            auto_create_task_scopes: true,
            auto_generate_notes: true,
            auto_learning: false,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new(default_repository())
    }
}

impl MemoryConfig {
    pub fn new(repository: PathBuf) -> Self {
        Self {
            repository,
            submodules: Vec::new(),
            storage: StorageConfig::default(),
            compression: CompressionConfig::default(),
            beads: BeadsConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CONFUCIUS_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production)
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(repo) = lookup("CONFUCIUS_REPOSITORY") {
            self.repository = PathBuf::from(repo);
        }
        if let Some(submodules) = lookup("CONFUCIUS_SUBMODULES") {
            self.submodules = submodules
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(path) = lookup("CONFUCIUS_STORAGE_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        if let Some(tokens) = lookup("CONFUCIUS_TARGET_TOKENS") {
            self.compression.target_tokens = tokens.trim().parse().map_err(|_| {
                CcaError::Config(format!("CONFUCIUS_TARGET_TOKENS is not a number: {}", tokens))
            })?;
        }
        if let Some(flag) = lookup("CONFUCIUS_AUTO_LEARNING") {
            self.beads.auto_learning = flag.trim() == "true";
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_submodules<I, S>(mut self, submodules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submodules = submodules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_storage_path(mut self, path: PathBuf) -> Self {
        self.storage.path = path;
        self
    }

    pub fn with_target_tokens(mut self, target_tokens: usize) -> Self {
        self.compression.target_tokens = target_tokens;
        self
    }

    pub fn with_retention_days(mut self, days: Option<u64>) -> Self {
        self.storage.retention_days = days;
        self
    }

    /// Storage directory, resolved against the repository root when relative
    pub fn storage_path(&self) -> PathBuf {
        if self.storage.path.is_absolute() {
            self.storage.path.clone()
        } else {
            self.repository.join(&self.storage.path)
        }
    }

    /// Directory `bd` commands run in
    pub fn beads_database_path(&self) -> PathBuf {
        self.beads
            .database_path
            .clone()
            .unwrap_or_else(|| self.repository.clone())
    }

    fn validate(&self) -> Result<()> {
        let level = self.compression.compression_level;
        if !(0.0..=1.0).contains(&level) {
            return Err(CcaError::Config(format!(
                "compression_level must be within [0, 1], got {}",
                level
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for submodule in &self.submodules {
            if submodule.is_empty() {
                return Err(CcaError::Config("submodule names must not be empty".to_string()));
            }
            if !seen.insert(submodule) {
                return Err(CcaError::Config(format!("duplicate submodule: {}", submodule)));
            }
        }
        Ok(())
    }
}

/// Locate a config file: `<repo>/.confucius.toml`, then `<config dir>/confucius/config.toml`
pub fn discover_config_file(repository: &Path) -> Option<PathBuf> {
    let local = repository.join(REPO_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    let global = dirs::config_dir()?.join("confucius").join("config.toml");
    global.exists().then_some(global)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = MemoryConfig::new(PathBuf::from("/repo"));
        assert_eq!(config.compression.target_tokens, 100_000);
        assert_eq!(config.compression.scope_budgets.repository, 0.1);
        assert_eq!(config.storage.retention_days, Some(90));
        assert_eq!(config.storage_path(), PathBuf::from("/repo/.beads/memory"));
        assert_eq!(config.beads_database_path(), PathBuf::from("/repo"));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = MemoryConfig::from_toml(
            r#"
            repository = "/work/white_room"
            submodules = ["sdk", "juce_backend"]

            [compression]
            target_tokens = 8000
            compression_level = 0.7

            [storage]
            path = "/var/lib/cca"
            "#,
        )
        .unwrap();

        assert_eq!(config.submodules, vec!["sdk", "juce_backend"]);
        assert_eq!(config.compression.target_tokens, 8000);
        assert_eq!(config.compression.scope_budgets.task, 0.3);
        assert_eq!(config.storage.backend, StorageBackendKind::Filesystem);
        assert_eq!(config.storage_path(), PathBuf::from("/var/lib/cca"));
        assert!(!config.beads.auto_learning);
    }

    #[test]
    fn test_invalid_compression_level() {
        let err = MemoryConfig::from_toml("[compression]\ncompression_level = 1.5\n").unwrap_err();
        assert!(matches!(err, CcaError::Config(_)));
    }

    #[test]
    fn test_duplicate_submodule_rejected() {
        let err = MemoryConfig::from_toml(r#"submodules = ["sdk", "sdk"]"#).unwrap_err();
        assert!(matches!(err, CcaError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CONFUCIUS_SUBMODULES", "sdk, swift_frontend,,daw_control"),
            ("CONFUCIUS_TARGET_TOKENS", "4000"),
            ("CONFUCIUS_AUTO_LEARNING", "true"),
        ]
        .into_iter()
        .collect();

        let config = MemoryConfig::default()
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.submodules, vec!["sdk", "swift_frontend", "daw_control"]);
        assert_eq!(config.compression.target_tokens, 4000);
        assert!(config.beads.auto_learning);
    }

    #[test]
    fn test_env_override_bad_number() {
        let result = MemoryConfig::default().apply_overrides(|key| {
            (key == "CONFUCIUS_TARGET_TOKENS").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(CcaError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "submodules = [\"sdk\"]\n").await.unwrap();

        let config = MemoryConfig::load(&path).await.unwrap();
        assert_eq!(config.submodules, vec!["sdk"]);
    }
}
