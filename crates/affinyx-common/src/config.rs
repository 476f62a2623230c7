//! Configuration loading for affinyx.
//! Reads affinyx.toml from the current directory or the path in AFFINYX_CONFIG,
//! then applies the Hugging Face environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::layout::ResultsLayout;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default = "default_results_root")]
    pub results_root: PathBuf,
    /// Optional data/results release, stored under `v<version>`.
    #[serde(default)]
    pub version: Option<String>,
}

fn default_data_root()    -> PathBuf { PathBuf::from("../data") }
fn default_results_root() -> PathBuf { PathBuf::from("results") }

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            results_root: default_results_root(),
            version: None,
        }
    }
}

/// Pretrained model hub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Download cache. Falls back to `HF_HOME`/`TRANSFORMERS_CACHE`, then the user cache dir.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Never touch the network; only use files already in the cache.
    #[serde(default)]
    pub offline: bool,
    #[serde(default = "default_protein_lm")]
    pub protein_lm: String,
    /// Chemical language model over SELFIES strings, for the CD/CED ligand branch.
    #[serde(default = "default_ligand_lm")]
    pub ligand_lm: String,
    #[serde(default = "bool_true")]
    pub use_gpu: bool,
}

fn default_protein_lm() -> String { "Rostlab/prot_bert".to_string() }
fn default_ligand_lm()  -> String { "ncfrey/ChemGPT-4.7M".to_string() }
fn bool_true()          -> bool   { true }

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            offline: false,
            protein_lm: default_protein_lm(),
            ligand_lm: default_ligand_lm(),
            use_gpu: true,
        }
    }
}

impl HubConfig {
    /// Cache directory actually used for downloads.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("huggingface")
                .join("hub")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long non-coordinator ranks keep retrying the initial connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port()            -> u16 { 29500 }
fn default_connect_timeout() -> u64 { 300 }

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from affinyx.toml.
    /// Checks AFFINYX_CONFIG env var first, then the current directory.
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("AFFINYX_CONFIG")
            .unwrap_or_else(|_| "affinyx.toml".to_string());

        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Fold environment overrides into the config instead of mutating the
    /// process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.hub.cache_dir.is_none() {
            self.hub.cache_dir = lookup("HF_HOME")
                .or_else(|| lookup("TRANSFORMERS_CACHE"))
                .map(PathBuf::from);
        }
        if let Some(flag) = lookup("HF_HUB_OFFLINE") {
            self.hub.offline = matches!(flag.trim(), "1" | "true" | "TRUE" | "yes");
        }
    }

    pub fn layout(&self) -> ResultsLayout {
        ResultsLayout::new(
            &self.paths.results_root,
            &self.paths.data_root,
            self.paths.version.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = Config::from_file(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(cfg.distributed.port, 29500);
        assert_eq!(cfg.hub.protein_lm, "Rostlab/prot_bert");
        assert_eq!(cfg.hub.ligand_lm, "ncfrey/ChemGPT-4.7M");
        assert!(!cfg.hub.offline);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("affinyx.toml");
        std::fs::write(&path, "[paths]\nversion = \"31\"\n[distributed]\nport = 1234\n").unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.paths.version.as_deref(), Some("31"));
        assert_eq!(cfg.paths.results_root, PathBuf::from("results"));
        assert_eq!(cfg.distributed.port, 1234);
        assert_eq!(cfg.distributed.connect_timeout_secs, 300);
    }

    #[test]
    fn test_env_overrides_hub_settings() {
        let env: HashMap<&str, &str> = [
            ("TRANSFORMERS_CACHE", "/models/hf"),
            ("HF_HUB_OFFLINE", "1"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.hub.cache_dir, Some(PathBuf::from("/models/hf")));
        assert!(cfg.hub.offline);
        assert_eq!(cfg.hub.resolved_cache_dir(), PathBuf::from("/models/hf"));
    }

    #[test]
    fn test_explicit_cache_dir_wins_over_env() {
        let mut cfg = Config::default();
        cfg.hub.cache_dir = Some(PathBuf::from("/explicit"));
        cfg.apply_env(|k| (k == "HF_HOME").then(|| "/env".to_string()));
        assert_eq!(cfg.hub.cache_dir, Some(PathBuf::from("/explicit")));
    }
}
