//! Filesystem layout for results, checkpoints, and datasets.

use std::path::{Path, PathBuf};

use crate::options::{DataOpt, LigEdgeOpt, LigFeatOpt, ProEdgeOpt, ProFeatOpt};

/// Resolved result and data locations for one process.
#[derive(Debug, Clone)]
pub struct ResultsLayout {
    results: PathBuf,
    data_root: PathBuf,
}

impl ResultsLayout {
    /// `version` adds a `v<version>` level under both roots so result sets
    /// from different data releases never mix.
    pub fn new(results_root: impl Into<PathBuf>, data_root: impl Into<PathBuf>, version: Option<&str>) -> Self {
        let mut results = results_root.into();
        let mut data_root = data_root.into();
        if let Some(v) = version {
            results.push(format!("v{v}"));
            data_root.push(format!("v{v}"));
        }
        Self { results, data_root }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn media_dir(&self) -> PathBuf {
        self.results.join("model_media")
    }

    /// Per-dataset media directory.
    pub fn media_dir_for(&self, data: DataOpt) -> PathBuf {
        self.media_dir().join(data.as_str())
    }

    /// Test-set metrics table.
    pub fn stats_csv(&self) -> PathBuf {
        self.media_dir().join("model_stats.csv")
    }

    /// Validation-set metrics table.
    pub fn stats_csv_val(&self) -> PathBuf {
        self.media_dir().join("model_stats_val.csv")
    }

    pub fn model_save_dir(&self) -> PathBuf {
        self.results.join("model_checkpoints").join("ours")
    }

    /// Canonical checkpoint path for a model key.
    pub fn checkpoint_path(&self, model_key: &str) -> PathBuf {
        self.model_save_dir().join(format!("{model_key}.model"))
    }

    pub fn tune_dir(&self) -> PathBuf {
        self.results.join("tune")
    }

    /// Directory holding the prepared splits for one feature combination.
    pub fn dataset_dir(
        &self,
        data: DataOpt,
        feature: ProFeatOpt,
        edge: ProEdgeOpt,
        lig_feature: LigFeatOpt,
        lig_edge: LigEdgeOpt,
    ) -> PathBuf {
        self.data_root.join(data.as_str()).join(format!(
            "{feature}_{edge}_{lig_feature}_{lig_edge}"
        ))
    }

    /// Create every directory results are written into.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.model_save_dir())?;
        std::fs::create_dir_all(self.media_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_layout() {
        let layout = ResultsLayout::new("/r", "/d", Some("31"));
        assert_eq!(layout.stats_csv(), PathBuf::from("/r/v31/model_media/model_stats.csv"));
        assert_eq!(
            layout.checkpoint_path("DGM_davisD"),
            PathBuf::from("/r/v31/model_checkpoints/ours/DGM_davisD.model")
        );
        assert_eq!(
            layout.dataset_dir(
                DataOpt::PdbBind,
                ProFeatOpt::Nomsa,
                ProEdgeOpt::Binary,
                LigFeatOpt::Gvp,
                LigEdgeOpt::Binary
            ),
            PathBuf::from("/d/v31/PDBbind/nomsa_binary_gvp_binary")
        );
    }

    #[test]
    fn test_ensure_dirs_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ResultsLayout::new(tmp.path(), tmp.path().join("data"), None);
        layout.ensure_dirs().unwrap();
        assert!(layout.model_save_dir().is_dir());
        assert!(layout.media_dir().is_dir());
    }
}
