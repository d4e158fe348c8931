//! What gets persisted, and how it is stored.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use larder_common::{CacheConfig, FileConfig, PersistSettings};
use larder_engine::StateTree;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tree key holding persistence metadata. Never written to storage.
pub const META_KEY: &str = "_persist";

/// Stored form of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub data: BTreeMap<String, Value>,
}

/// Value of the `_persist` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistMeta {
    pub version: u32,
    /// Set once the restore action has been applied.
    pub rehydrated: bool,
}

impl PersistMeta {
    pub fn read(tree: &StateTree) -> Option<Self> {
        tree.slice(META_KEY).ok().flatten()
    }
}

#[derive(Debug, Clone)]
pub struct PersistConfig {
    pub key: String,
    pub version: u32,
    pub whitelist: Option<BTreeSet<String>>,
    pub blacklist: BTreeSet<String>,
    /// Keys left out unless whitelisted by name. Starts with the default
    /// cache sub-tree path.
    pub transient: BTreeSet<String>,
    pub throttle: Duration,
    pub hydrate_timeout: Duration,
}

impl PersistConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self::from_settings(&PersistSettings {
            key: key.into(),
            ..PersistSettings::default()
        })
    }

    pub fn from_settings(settings: &PersistSettings) -> Self {
        Self {
            key: settings.key.clone(),
            version: settings.version,
            whitelist: settings
                .whitelist
                .as_ref()
                .map(|keys| keys.iter().cloned().collect()),
            blacklist: settings.blacklist.iter().cloned().collect(),
            transient: BTreeSet::from([CacheConfig::default().reducer_path]),
            throttle: settings.throttle(),
            hydrate_timeout: settings.hydrate_timeout(),
        }
    }

    /// Settings from `config`, with its cache sub-tree kept out of storage.
    pub fn from_config(config: &FileConfig) -> Self {
        Self::from_settings(&config.persist).transient([config.cache.reducer_path.as_str()])
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn whitelist<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn blacklist<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn transient<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transient.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn hydrate_timeout(mut self, timeout: Duration) -> Self {
        self.hydrate_timeout = timeout;
        self
    }

    /// The storage key, `persist:<key>`.
    pub fn storage_key(&self) -> String {
        format!("persist:{}", self.key)
    }

    pub fn is_persisted(&self, key: &str) -> bool {
        if key == META_KEY || self.blacklist.contains(key) {
            return false;
        }
        match &self.whitelist {
            Some(allowed) => allowed.contains(key),
            None => !self.transient.contains(key),
        }
    }

    /// The persisted subset of `tree`, ready to store.
    pub fn envelope(&self, tree: &StateTree) -> Envelope {
        Envelope {
            version: self.version,
            data: tree
                .iter()
                .filter(|(key, _)| self.is_persisted(key))
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> StateTree {
        [
            ("auth".to_string(), json!({"token": "t"})),
            ("products".to_string(), json!({"search": ""})),
            ("api".to_string(), json!({"entries": {}})),
            (META_KEY.to_string(), json!({"version": 1, "rehydrated": true})),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn transient_keys_and_meta_are_left_out_by_default() {
        let config = PersistConfig::new("root");
        let envelope = config.envelope(&tree());
        assert_eq!(
            envelope.data.keys().collect::<Vec<_>>(),
            vec!["auth", "products"]
        );
        assert_eq!(envelope.version, 1);
    }

    #[test]
    fn cache_sub_tree_is_transient_without_configuration() {
        let mut tree = tree();
        tree.insert(
            "api",
            json!({"entries": {"getMyCart(null)": {"status": {"status": "loading"}}}}),
        );
        let envelope = PersistConfig::new("root").envelope(&tree);
        assert_eq!(
            envelope.data.keys().collect::<Vec<_>>(),
            vec!["auth", "products"]
        );
    }

    #[test]
    fn configured_cache_path_is_transient() {
        let mut file = FileConfig::default();
        file.cache.reducer_path = "queries".into();
        let config = PersistConfig::from_config(&file);
        assert!(!config.is_persisted("queries"));
        assert!(!config.is_persisted("api"));
        assert!(config.is_persisted("auth"));
    }

    #[test]
    fn whitelist_opts_transient_keys_in() {
        let config = PersistConfig::new("root").whitelist(["auth", "api", META_KEY]);
        let envelope = config.envelope(&tree());
        assert_eq!(envelope.data.keys().collect::<Vec<_>>(), vec!["api", "auth"]);
    }

    #[test]
    fn blacklist_wins_over_whitelist() {
        let config = PersistConfig::new("root")
            .whitelist(["auth", "products"])
            .blacklist(["products"]);
        assert!(config.is_persisted("auth"));
        assert!(!config.is_persisted("products"));
    }

    #[test]
    fn settings_carry_over() {
        let settings = PersistSettings {
            key: "shop".into(),
            version: 3,
            whitelist: Some(vec!["auth".into()]),
            throttle_ms: 250,
            ..PersistSettings::default()
        };
        let config = PersistConfig::from_settings(&settings);
        assert_eq!(config.storage_key(), "persist:shop");
        assert_eq!(config.version, 3);
        assert_eq!(config.throttle, Duration::from_millis(250));
        assert_eq!(config.hydrate_timeout, Duration::from_secs(5));
        assert!(!config.is_persisted("products"));
    }
}
