use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// TOML-backed configuration. Every section and field is optional; missing
/// values fall back to the defaults below. A handful of env vars override
/// the file (see [`FileConfig::apply_overrides`]).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub cache: CacheConfig,
    pub persist: PersistSettings,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    /// Top-level state key owned by the cache engine.
    pub reducer_path: String,
    /// Grace period before an entry with no subscribers is evicted.
    pub keep_unused_for_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reducer_path: "api".to_string(),
            keep_unused_for_ms: 60_000,
        }
    }
}

impl CacheConfig {
    pub fn keep_unused_for(&self) -> Duration {
        Duration::from_millis(self.keep_unused_for_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PersistSettings {
    pub key: String,
    pub version: u32,
    /// When set, only these keys are persisted.
    pub whitelist: Option<Vec<String>>,
    pub blacklist: Vec<String>,
    /// Minimum spacing between writes. 0 writes after every commit.
    pub throttle_ms: u64,
    pub hydrate_timeout_ms: u64,
    /// Directory used by the file storage backend.
    pub storage_dir: PathBuf,
}

impl Default for PersistSettings {
    fn default() -> Self {
        Self {
            key: "root".to_string(),
            version: 1,
            whitelist: None,
            blacklist: Vec::new(),
            throttle_ms: 0,
            hydrate_timeout_ms: 5_000,
            storage_dir: PathBuf::from(".larder"),
        }
    }
}

impl PersistSettings {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn hydrate_timeout(&self) -> Duration {
        Duration::from_millis(self.hydrate_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HttpConfig {
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 30_000,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl FileConfig {
    /// Load `.env`, then the TOML file if one is given, then apply env
    /// overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => load_config(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("LARDER_API_URL").filter(|s| !s.is_empty()) {
            self.http.base_url = Some(url);
        }
        if let Some(dir) = lookup("LARDER_STORAGE_DIR").filter(|s| !s.is_empty()) {
            self.persist.storage_dir = PathBuf::from(dir);
        }
        if let Some(key) = lookup("LARDER_PERSIST_KEY").filter(|s| !s.is_empty()) {
            self.persist.key = key;
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  cache: reducer_path={} keep_unused_for={}ms",
            self.cache.reducer_path,
            self.cache.keep_unused_for_ms
        );
        tracing::info!(
            "  persist: key={} version={} dir={}",
            self.persist.key,
            self.persist.version,
            self.persist.storage_dir.display()
        );
        tracing::info!(
            "  http: base_url={}",
            self.http.base_url.as_deref().unwrap_or("<not set>")
        );
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_uses_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert_eq!(config.cache.reducer_path, "api");
        assert_eq!(config.cache.keep_unused_for(), Duration::from_secs(60));
        assert_eq!(config.persist.key, "root");
        assert_eq!(config.persist.version, 1);
        assert!(config.persist.whitelist.is_none());
        assert_eq!(config.persist.hydrate_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config: FileConfig = toml::from_str(
            r#"
            [cache]
            keep_unused_for_ms = 1500

            [persist]
            version = 3
            whitelist = ["auth"]
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.reducer_path, "api");
        assert_eq!(config.cache.keep_unused_for_ms, 1500);
        assert_eq!(config.persist.version, 3);
        assert_eq!(config.persist.whitelist, Some(vec!["auth".to_string()]));
        assert_eq!(config.persist.key, "root");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<FileConfig, _> = toml::from_str("[cache]\nttl = 5\n");
        assert!(result.is_err());
    }

    #[test]
    fn env_overrides_win_over_file() {
        let env: HashMap<&str, &str> = [
            ("LARDER_API_URL", "http://localhost:8000/api/"),
            ("LARDER_PERSIST_KEY", "shop"),
            ("LARDER_STORAGE_DIR", ""),
        ]
        .into_iter()
        .collect();

        let mut config = FileConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(
            config.http.base_url.as_deref(),
            Some("http://localhost:8000/api/")
        );
        assert_eq!(config.persist.key, "shop");
        // Empty values are ignored.
        assert_eq!(config.persist.storage_dir, PathBuf::from(".larder"));
    }

    #[test]
    fn load_config_reads_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("larder.toml");
        std::fs::write(&path, "[http]\nbase_url = \"http://example.test/\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.http.base_url.as_deref(), Some("http://example.test/"));

        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
