//! Assembling one run: data, parameters, model and loaders.

use affinyx_common::{DataOpt, ResultsLayout, RunConfig};
use affinyx_models::AffinityModel;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use crate::dataset::{DataLoader, DatasetSplits};
use crate::error::Result;

/// Early-stopping patience of a full training run; large enough that runs
/// normally go the whole schedule.
pub const PATIENCE: usize = 1000;

/// Validation loss improvement that counts as progress. PDBbind affinities
/// span a wider range than the kinase sets.
pub fn min_delta_for(dataset: DataOpt) -> f64 {
    match dataset {
        DataOpt::PdbBind => 0.2,
        _ => 0.05,
    }
}

/// Load the prepared splits `cfg` trains on.
pub fn load_splits(layout: &ResultsLayout, cfg: &RunConfig) -> Result<DatasetSplits> {
    let dir = layout.dataset_dir(cfg.dataset, cfg.feature_opt, cfg.edge_opt, cfg.lig_feat_opt, cfg.lig_edge_opt);
    DatasetSplits::load(&dir, cfg.fold_selection, cfg.model.uses_pretrained_lm())
}

pub struct Loaders {
    pub train: DataLoader,
    pub val: DataLoader,
    pub test: DataLoader,
}

/// A model with freshly initialised parameters and the data it trains on.
pub struct RunSession {
    pub cfg: RunConfig,
    pub splits: DatasetSplits,
    pub varmap: VarMap,
    pub model: AffinityModel,
    pub device: Device,
}

impl RunSession {
    pub fn new(cfg: RunConfig, splits: DatasetSplits, device: Device) -> Result<Self> {
        cfg.validate()?;
        let dims = splits.dims()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = AffinityModel::build(&cfg, dims, vb)?;
        let params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        info!("Built {} with {params} parameters on {:?}", cfg.model, device);
        Ok(Self { cfg, splits, varmap, model, device })
    }

    /// Training batches are shuffled from `seed` and sharded by rank; the
    /// evaluation sets are visited whole, in order, on every rank.
    pub fn loaders(&self, seed: u64, rank: usize, world_size: usize) -> Loaders {
        let bs = self.cfg.batch_size;
        Loaders {
            train: DataLoader::new(self.splits.train.clone(), bs)
                .shuffled(seed)
                .sharded(rank, world_size),
            val: DataLoader::new(self.splits.val.clone(), bs),
            test: DataLoader::new(self.splits.test.clone(), bs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::tiny_dataset;
    use affinyx_common::{LigEdgeOpt, LigFeatOpt, ModelOpt, ProEdgeOpt, ProFeatOpt};
    use std::sync::Arc;

    fn cfg() -> RunConfig {
        RunConfig {
            model: ModelOpt::Dg,
            dataset: DataOpt::Davis,
            feature_opt: ProFeatOpt::Nomsa,
            edge_opt: ProEdgeOpt::Binary,
            lig_feat_opt: LigFeatOpt::Original,
            lig_edge_opt: LigEdgeOpt::Binary,
            fold_selection: Some(0),
            protein_overlap: false,
            batch_size: 2,
            lr: 1e-3,
            epochs: 1,
            arch: Default::default(),
            save_checkpoint: false,
        }
    }

    #[test]
    fn test_min_delta() {
        assert_eq!(min_delta_for(DataOpt::PdbBind), 0.2);
        assert_eq!(min_delta_for(DataOpt::Kiba), 0.05);
    }

    #[test]
    fn test_session_builds_model_and_loaders() {
        let ds = Arc::new(tiny_dataset(5));
        let splits = DatasetSplits { train: ds.clone(), val: ds.clone(), test: ds };
        let session = RunSession::new(cfg(), splits, Device::Cpu).unwrap();
        assert!(!session.varmap.all_vars().is_empty());

        let loaders = session.loaders(7, 1, 2);
        // 5 samples padded to 6, rank 1 takes 3 of them
        assert_eq!(loaders.train.epoch_indices(0).len(), 3);
        assert_eq!(loaders.val.num_batches(), 3);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let ds = Arc::new(tiny_dataset(2));
        let splits = DatasetSplits { train: ds.clone(), val: ds.clone(), test: ds };
        let bad = RunConfig { batch_size: 0, ..cfg() };
        assert!(RunSession::new(bad, splits, Device::Cpu).is_err());
    }
}
