//! TOML-backed configuration implementing the settings the core reads.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;

use crate::store::SettingsStore;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Flat directory holding the per-pending-file cache pairs.
    pub cache_path: PathBuf,
    /// Where the filesystem is mounted.
    pub mount_root: PathBuf,
    /// Total quota in bytes, reported through `statfs`.
    pub quota: u64,
    /// Bytes already used remotely.
    pub used_quota: u64,
    /// Worker threads for the request dispatcher.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from(".nimbusfs/cache"),
            mount_root: PathBuf::from("nimbus"),
            quota: 0,
            used_quota: 0,
            workers: 4,
        }
    }
}

impl Config {
    /// Loads a config file, falling back to defaults when the file is
    /// missing or malformed.
    pub fn load(path: &Path) -> Config {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("could not read {}: {}, using defaults", path.display(), e);
                return Config::default();
            }
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("could not parse {}: {}, using defaults", path.display(), e);
                Config::default()
            }
        }
    }
}

impl SettingsStore for Config {
    fn quota(&self) -> u64 {
        self.quota
    }

    fn used_quota(&self) -> u64 {
        self.used_quota
    }

    fn cache_path(&self) -> PathBuf {
        self.cache_path.clone()
    }

    fn mount_root(&self) -> PathBuf {
        self.mount_root.clone()
    }
}
