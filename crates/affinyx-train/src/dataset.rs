//! Affinity datasets, split files and batch loaders.
//!
//! A prepared dataset directory (see `ResultsLayout::dataset_dir`) holds one
//! JSON array of [`AffinitySample`] per split: `train{fold}.json`,
//! `val{fold}.json` and `test.json`. Protein-language-model features live in
//! `*.plm.json` siblings written by `affinyx embed`.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use affinyx_models::{FeatureDims, Graph, GraphBatch};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TrainError};

/// One protein/ligand pair with its measured affinity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinitySample {
    /// Identifier of the pair, e.g. a PDB code.
    pub code: String,
    pub protein: Graph,
    pub ligand: Graph,
    pub affinity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }

    /// File name of this split. Train/val files carry the fold number; the
    /// test set is shared by every fold.
    pub fn file_name(&self, fold: Option<u32>, plm: bool) -> String {
        let stem = match (self, fold) {
            (Split::Test, _) | (_, None) => self.as_str().to_string(),
            (_, Some(f)) => format!("{}{f}", self.as_str()),
        };
        if plm {
            format!("{stem}.plm.json")
        } else {
            format!("{stem}.json")
        }
    }
}

impl std::str::FromStr for Split {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => Err(TrainError::Data(format!("unknown split '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AffinityDataset {
    samples: Vec<AffinitySample>,
}

impl AffinityDataset {
    pub fn new(samples: Vec<AffinitySample>) -> Result<Self> {
        let ds = Self { samples };
        ds.validate()?;
        Ok(ds)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| TrainError::Data(format!("cannot open {}: {e}", path.display())))?;
        let samples: Vec<AffinitySample> = serde_json::from_reader(BufReader::new(file))?;
        debug!("Loaded {} samples from {}", samples.len(), path.display());
        Self::new(samples)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.partial");
        {
            let writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(writer, &self.samples)?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let Some(first) = self.samples.first() else {
            return Ok(());
        };
        let dims = sample_dims(first);
        let tables = (first.protein.tables(), first.ligand.tables());
        for s in &self.samples {
            s.protein
                .validate()
                .and_then(|_| s.ligand.validate())
                .map_err(|e| TrainError::Data(format!("sample {}: {e}", s.code)))?;
            if sample_dims(s) != dims {
                return Err(TrainError::Data(format!(
                    "sample {} has feature dims {:?}, expected {:?}",
                    s.code,
                    sample_dims(s),
                    dims
                )));
            }
            let own = (s.protein.tables(), s.ligand.tables());
            if own != tables {
                return Err(TrainError::Data(format!(
                    "sample {} carries optional tables {:?}, but {} carries {:?}",
                    s.code, own, first.code, tables
                )));
            }
            if !s.affinity.is_finite() {
                return Err(TrainError::Data(format!("sample {} has affinity {}", s.code, s.affinity)));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[AffinitySample] {
        &self.samples
    }

    pub fn dims(&self) -> Result<FeatureDims> {
        self.samples
            .first()
            .map(sample_dims)
            .ok_or_else(|| TrainError::Data("empty dataset has no feature dims".into()))
    }

    /// Replace protein node features with per-residue language model
    /// embeddings. `embed` receives sequences and returns one `[len, hidden]`
    /// matrix per sequence.
    pub fn attach_plm_features<F>(&mut self, batch_size: usize, mut embed: F) -> Result<()>
    where
        F: FnMut(&[String]) -> Result<Vec<Vec<Vec<f32>>>>,
    {
        for chunk in self.samples.chunks_mut(batch_size.max(1)) {
            let seqs = chunk
                .iter()
                .map(|s| {
                    s.protein
                        .seq
                        .clone()
                        .ok_or_else(|| TrainError::Data(format!("protein of {} has no sequence", s.code)))
                })
                .collect::<Result<Vec<_>>>()?;
            let embeddings = embed(&seqs)?;
            if embeddings.len() != chunk.len() {
                return Err(TrainError::Data(format!(
                    "embedder returned {} results for {} sequences",
                    embeddings.len(),
                    chunk.len()
                )));
            }
            for (sample, emb) in chunk.iter_mut().zip(embeddings) {
                if emb.len() != sample.protein.num_nodes() {
                    return Err(TrainError::Data(format!(
                        "{}: {} residue embeddings for {} graph nodes",
                        sample.code,
                        emb.len(),
                        sample.protein.num_nodes()
                    )));
                }
                sample.protein.x = emb;
            }
        }
        self.validate()
    }

    /// Attach one whole-ligand language model embedding per sample. `embed`
    /// receives SMILES strings and returns one vector per string.
    pub fn attach_ligand_lm_features<F>(&mut self, batch_size: usize, mut embed: F) -> Result<()>
    where
        F: FnMut(&[String]) -> Result<Vec<Vec<f32>>>,
    {
        for chunk in self.samples.chunks_mut(batch_size.max(1)) {
            let smiles = chunk
                .iter()
                .map(|s| {
                    s.ligand
                        .seq
                        .clone()
                        .ok_or_else(|| TrainError::Data(format!("ligand of {} has no SMILES", s.code)))
                })
                .collect::<Result<Vec<_>>>()?;
            let embeddings = embed(&smiles)?;
            if embeddings.len() != chunk.len() {
                return Err(TrainError::Data(format!(
                    "embedder returned {} results for {} ligands",
                    embeddings.len(),
                    chunk.len()
                )));
            }
            for (sample, emb) in chunk.iter_mut().zip(embeddings) {
                sample.ligand.lm_emb = Some(emb);
            }
        }
        self.validate()
    }
}

fn sample_dims(s: &AffinitySample) -> FeatureDims {
    FeatureDims { protein: s.protein.dims(), ligand: s.ligand.dims() }
}

/// Train, validation and test sets of one run.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: Arc<AffinityDataset>,
    pub val: Arc<AffinityDataset>,
    pub test: Arc<AffinityDataset>,
}

impl DatasetSplits {
    pub fn split_path(dir: &Path, split: Split, fold: Option<u32>, plm: bool) -> PathBuf {
        dir.join(split.file_name(fold, plm))
    }

    pub fn load(dir: &Path, fold: Option<u32>, plm: bool) -> Result<Self> {
        let load = |split| AffinityDataset::load(&Self::split_path(dir, split, fold, plm)).map(Arc::new);
        let splits = Self { train: load(Split::Train)?, val: load(Split::Val)?, test: load(Split::Test)? };
        info!(
            "Loaded {} (train {}, val {}, test {})",
            dir.display(),
            splits.train.len(),
            splits.val.len(),
            splits.test.len()
        );
        for (split, ds) in [(Split::Train, &splits.train), (Split::Val, &splits.val), (Split::Test, &splits.test)] {
            if ds.is_empty() {
                return Err(TrainError::Data(format!("no {} samples in {}", split.as_str(), dir.display())));
            }
        }
        Ok(splits)
    }

    pub fn dims(&self) -> Result<FeatureDims> {
        self.train.dims()
    }
}

/// A collated mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub protein: GraphBatch,
    pub ligand: GraphBatch,
    /// Targets `[B, 1]`.
    pub y: Tensor,
    pub size: usize,
}

/// Splits a dataset into mini-batches, optionally shuffled per epoch and
/// sharded across ranks.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<AffinityDataset>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    shard: Option<(usize, usize)>,
}

impl DataLoader {
    pub fn new(dataset: Arc<AffinityDataset>, batch_size: usize) -> Self {
        Self { dataset, batch_size: batch_size.max(1), shuffle: false, seed: 0, shard: None }
    }

    /// Reshuffle every epoch from `seed + epoch`.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    /// Keep only the indices of `rank` out of `world_size`.
    pub fn sharded(mut self, rank: usize, world_size: usize) -> Self {
        if world_size > 1 {
            self.shard = Some((rank, world_size));
        }
        self
    }

    pub fn dataset(&self) -> &AffinityDataset {
        &self.dataset
    }

    /// Sample indices this loader visits in `epoch`.
    ///
    /// When sharded, the (shuffled) index list is padded by wrapping around to
    /// a multiple of the world size and rank `r` takes every `world`-th index
    /// starting at `r`, so all ranks see the same number of samples.
    pub fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        match self.shard {
            Some((rank, world)) if !indices.is_empty() => {
                let total = indices.len().div_ceil(world) * world;
                let padded: Vec<usize> = indices.iter().copied().cycle().take(total).collect();
                padded.into_iter().skip(rank).step_by(world).collect()
            }
            _ => indices,
        }
    }

    pub fn batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        self.epoch_indices(epoch)
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }

    pub fn num_batches(&self) -> usize {
        self.batches(0).len()
    }

    pub fn collate(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let samples: Vec<&AffinitySample> = indices
            .iter()
            .map(|&i| {
                self.dataset
                    .samples
                    .get(i)
                    .ok_or_else(|| TrainError::Data(format!("sample index {i} out of range")))
            })
            .collect::<Result<_>>()?;
        let proteins: Vec<&Graph> = samples.iter().map(|s| &s.protein).collect();
        let ligands: Vec<&Graph> = samples.iter().map(|s| &s.ligand).collect();
        let y: Vec<f32> = samples.iter().map(|s| s.affinity).collect();
        Ok(Batch {
            protein: GraphBatch::collate(&proteins, device)?,
            ligand: GraphBatch::collate(&ligands, device)?,
            y: Tensor::from_vec(y, (samples.len(), 1), device)?,
            size: samples.len(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn tiny_graph(n: usize, feat: usize, value: f32) -> Graph {
        let mut edge_index = Vec::new();
        for i in 1..n as u32 {
            edge_index.push([i - 1, i]);
            edge_index.push([i, i - 1]);
        }
        Graph {
            x: vec![vec![value; feat]; n],
            edge_index,
            seq: Some("ACDEFGHIKL".chars().take(n).collect()),
            ..Default::default()
        }
    }

    pub(crate) fn tiny_dataset(n: usize) -> AffinityDataset {
        let samples = (0..n)
            .map(|i| AffinitySample {
                code: format!("s{i}"),
                protein: tiny_graph(3 + i % 2, 4, i as f32 * 0.1),
                ligand: tiny_graph(2, 3, 1.0 - i as f32 * 0.1),
                affinity: 5.0 + i as f32 * 0.25,
            })
            .collect();
        AffinityDataset::new(samples).unwrap()
    }

    #[test]
    fn test_split_file_names() {
        assert_eq!(Split::Train.file_name(Some(2), false), "train2.json");
        assert_eq!(Split::Val.file_name(None, false), "val.json");
        assert_eq!(Split::Test.file_name(Some(2), true), "test.plm.json");
    }

    #[test]
    fn test_sharding_covers_dataset_with_equal_counts() {
        let ds = Arc::new(tiny_dataset(10));
        let world = 3;
        let shards: Vec<Vec<usize>> = (0..world)
            .map(|r| DataLoader::new(ds.clone(), 2).shuffled(7).sharded(r, world).epoch_indices(1))
            .collect();

        for shard in &shards {
            assert_eq!(shard.len(), 4);
        }
        let mut all: Vec<usize> = shards.concat();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_is_seeded_per_epoch() {
        let ds = Arc::new(tiny_dataset(20));
        let a = DataLoader::new(ds.clone(), 4).shuffled(3);
        let b = DataLoader::new(ds, 4).shuffled(3);
        assert_eq!(a.epoch_indices(0), b.epoch_indices(0));
        assert_ne!(a.epoch_indices(0), a.epoch_indices(1));
    }

    #[test]
    fn test_collate_batch() {
        let loader = DataLoader::new(Arc::new(tiny_dataset(5)), 2);
        let batches = loader.batches(0);
        assert_eq!(batches.len(), 3);
        let batch = loader.collate(&batches[0], &Device::Cpu).unwrap();
        assert_eq!(batch.size, 2);
        assert_eq!(batch.y.to_vec2::<f32>().unwrap(), vec![vec![5.0], vec![5.25]]);
        assert_eq!(batch.protein.num_graphs, 2);
    }

    #[test]
    fn test_save_load_and_plm_features() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("train0.json");
        let mut ds = tiny_dataset(3);
        ds.save(&path).unwrap();
        assert_eq!(AffinityDataset::load(&path).unwrap().samples(), ds.samples());

        ds.attach_plm_features(2, |seqs| {
            Ok(seqs.iter().map(|s| vec![vec![0.5; 6]; s.len()]).collect())
        })
        .unwrap();
        assert_eq!(ds.dims().unwrap().protein.node, 6);
    }

    #[test]
    fn test_plm_length_mismatch_is_rejected() {
        let mut ds = tiny_dataset(2);
        let err = ds
            .attach_plm_features(4, |seqs| Ok(seqs.iter().map(|_| vec![vec![0.0; 6]; 1]).collect()))
            .unwrap_err();
        assert!(err.to_string().contains("residue embeddings"));
    }

    #[test]
    fn test_optional_tables_must_be_uniform() {
        let mut samples = tiny_dataset(4).samples().to_vec();
        let edges = samples[2].protein.num_edges();
        samples[2].protein.edge_weight = Some(vec![1.0; edges]);
        let err = AffinityDataset::new(samples.clone()).unwrap_err();
        assert!(err.to_string().contains("s2"), "{err}");

        for s in samples.iter_mut() {
            let edges = s.protein.num_edges();
            s.protein.edge_weight = Some(vec![1.0; edges]);
        }
        assert!(AffinityDataset::new(samples).is_ok());
    }

    #[test]
    fn test_ligand_lm_features() {
        let mut ds = tiny_dataset(3);
        ds.attach_ligand_lm_features(2, |smiles| Ok(smiles.iter().map(|s| vec![s.len() as f32; 5]).collect()))
            .unwrap();
        assert_eq!(ds.dims().unwrap().ligand.lm_emb, 5);
        assert!(ds.samples().iter().all(|s| s.ligand.lm_emb.is_some()));
    }

    #[test]
    fn test_empty_evaluation_splits_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        tiny_dataset(4).save(&DatasetSplits::split_path(dir, Split::Train, Some(0), false)).unwrap();
        tiny_dataset(2).save(&DatasetSplits::split_path(dir, Split::Test, Some(0), false)).unwrap();
        AffinityDataset::default().save(&DatasetSplits::split_path(dir, Split::Val, Some(0), false)).unwrap();

        let err = DatasetSplits::load(dir, Some(0), false).unwrap_err();
        assert!(err.to_string().contains("no val samples"), "{err}");

        tiny_dataset(2).save(&DatasetSplits::split_path(dir, Split::Val, Some(0), false)).unwrap();
        assert!(DatasetSplits::load(dir, Some(0), false).is_ok());
    }

    #[test]
    fn test_inconsistent_dims_are_rejected() {
        let mut samples = tiny_dataset(2).samples().to_vec();
        samples[1].ligand = tiny_graph(2, 9, 0.0);
        assert!(AffinityDataset::new(samples).is_err());
    }
}
