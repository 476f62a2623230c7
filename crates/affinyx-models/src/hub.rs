//! Hugging Face hub access shared by the frozen language models.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{CacheRepo, Repo, RepoType};
use tracing::{debug, info};

use crate::{ModelError, Result};

/// A model repository, read either through the API (downloading into the
/// cache) or straight from the cache when offline.
pub enum HubRepo {
    Cache { model_id: String, repo: CacheRepo },
    Api { model_id: String, repo: ApiRepo },
}

impl HubRepo {
    pub fn open(model_id: &str, cache_dir: &Path, offline: bool) -> Result<Self> {
        let repo = Repo::new(model_id.to_string(), RepoType::Model);
        if offline {
            let repo = hf_hub::Cache::new(cache_dir.to_path_buf()).repo(repo);
            return Ok(Self::Cache { model_id: model_id.to_string(), repo });
        }
        let api = ApiBuilder::new().with_cache_dir(cache_dir.to_path_buf()).with_progress(false).build()?;
        Ok(Self::Api { model_id: model_id.to_string(), repo: api.repo(repo) })
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::Cache { model_id, .. } | Self::Api { model_id, .. } => model_id,
        }
    }

    /// Path of a file the model cannot do without.
    pub fn get(&self, file: &str) -> Result<PathBuf> {
        match self {
            Self::Cache { model_id, repo } => repo
                .get(file)
                .ok_or_else(|| ModelError::Download(format!("{file} for {model_id} not in offline cache"))),
            Self::Api { repo, .. } => {
                info!("Fetching {file}...");
                Ok(repo.get(file)?)
            }
        }
    }

    /// Path of an optional file, `None` if the repository lacks it.
    pub fn try_get(&self, file: &str) -> Option<PathBuf> {
        match self {
            Self::Cache { repo, .. } => repo.get(file),
            Self::Api { repo, .. } => repo.get(file).ok(),
        }
    }

    /// Model weights, preferring safetensors over a pickled checkpoint.
    pub fn weights(&self) -> Result<PathBuf> {
        self.try_get("model.safetensors")
            .or_else(|| self.try_get("pytorch_model.bin"))
            .ok_or_else(|| ModelError::Download(format!("no weights for {}", self.model_id())))
    }
}

/// First available accelerator when `use_gpu` is set, else the CPU.
pub fn select_device(use_gpu: bool) -> Result<Device> {
    if !use_gpu {
        return Ok(Device::Cpu);
    }

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => return Ok(device),
            Err(e) => debug!("CUDA not available: {}, falling back to CPU", e),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => return Ok(device),
            Err(e) => debug!("Metal not available: {}, falling back to CPU", e),
        }
    }

    debug!("Using CPU");
    Ok(Device::Cpu)
}

/// Map a downloaded weights file into a [`VarBuilder`].
pub fn load_weights(path: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    if path.extension().is_some_and(|e| e == "safetensors") {
        // SAFETY: the file is a downloaded model artifact that is not modified while mapped.
        Ok(unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? })
    } else {
        Ok(VarBuilder::from_pth(path, DType::F32, device)?)
    }
}

/// Read a model's `config.json`.
pub fn read_config(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_repo_reports_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = HubRepo::open("ncfrey/ChemGPT-4.7M", tmp.path(), true).unwrap();
        assert_eq!(repo.model_id(), "ncfrey/ChemGPT-4.7M");
        assert!(repo.try_get("tokenizer.json").is_none());
        assert!(matches!(repo.get("config.json"), Err(ModelError::Download(_))));
        assert!(matches!(repo.weights(), Err(ModelError::Download(_))));
    }

    #[test]
    fn test_cpu_when_gpu_disabled() {
        assert!(matches!(select_device(false).unwrap(), Device::Cpu));
    }
}
