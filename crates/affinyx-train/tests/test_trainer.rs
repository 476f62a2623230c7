//! Training loop, checkpoint saver and sentinel reporting on a tiny dataset.
//!
//! ```bash
//! cargo test --package affinyx-train --test test_trainer
//! ```

use std::cell::Cell;
use std::sync::Arc;

use affinyx_common::{DataOpt, LigEdgeOpt, LigFeatOpt, ModelOpt, ProEdgeOpt, ProFeatOpt, RunConfig};
use affinyx_models::{checkpoint, BindingModel, Graph, GraphBatch, ModelError};
use affinyx_train::{
    AffinityDataset, AffinitySample, CheckpointSaver, DataLoader, DatasetSplits, LocalGroup, Retention,
    RunOutcome, RunSession, Trainer, SENTINEL_LOSS,
};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};

fn graph(n: usize, feat: usize, value: f32) -> Graph {
    let mut edge_index = Vec::new();
    for i in 1..n as u32 {
        edge_index.push([i - 1, i]);
        edge_index.push([i, i - 1]);
    }
    Graph { x: vec![vec![value; feat]; n], edge_index, ..Default::default() }
}

fn dataset(n: usize) -> Arc<AffinityDataset> {
    let samples = (0..n)
        .map(|i| AffinitySample {
            code: format!("p{i}"),
            protein: graph(4, 5, i as f32 / n as f32),
            ligand: graph(3, 4, 1.0 - i as f32 / n as f32),
            affinity: 5.0 + i as f32 * 0.5,
        })
        .collect();
    Arc::new(AffinityDataset::new(samples).unwrap())
}

fn run_config(epochs: usize) -> RunConfig {
    RunConfig {
        model: ModelOpt::Dg,
        dataset: DataOpt::Davis,
        feature_opt: ProFeatOpt::Nomsa,
        edge_opt: ProEdgeOpt::Binary,
        lig_feat_opt: LigFeatOpt::Original,
        lig_edge_opt: LigEdgeOpt::Binary,
        fold_selection: Some(0),
        protein_overlap: false,
        batch_size: 4,
        lr: 1e-3,
        epochs,
        arch: Default::default(),
        save_checkpoint: false,
    }
}

#[test]
fn test_fit_records_every_epoch_and_saves_best() {
    let tmp = tempfile::tempdir().unwrap();
    let ds = dataset(8);
    let splits = DatasetSplits { train: ds.clone(), val: ds.clone(), test: ds };
    let session = RunSession::new(run_config(3), splits, Device::Cpu).unwrap();
    let loaders = session.loaders(0, 0, 1);

    let path = tmp.path().join("DG.model");
    let mut saver = CheckpointSaver::new(session.varmap.clone(), &path, 0.0, 1000, Retention::Best, 0)
        .with_provenance("DG", ModelOpt::Dg);

    let group = LocalGroup;
    let mut trainer = Trainer::new(&session.model, &session.varmap, 1e-3, Device::Cpu, &group).unwrap();
    let mut seen = Vec::new();
    let (outcome, log) = trainer
        .fit(&loaders.train, &loaders.val, 3, Some(&mut saver), |r| seen.push(r.epoch))
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed { epochs_run: 3, stopped_early: false });
    assert_eq!(seen, vec![0, 1, 2]);
    assert_eq!(log.epochs.len(), 3);
    assert!(log.epochs.iter().all(|r| r.val_loss.is_finite()));
    assert!(saver.tmp_path().exists());

    saver.save().unwrap();
    assert!(path.exists());
    assert!(!saver.tmp_path().exists());

    let (meta, state) = checkpoint::read_checkpoint(&path, &Device::Cpu).unwrap();
    assert_eq!(meta.model, Some(ModelOpt::Dg));
    assert_eq!(meta.epoch, saver.best_epoch());
    assert_eq!(state.len(), session.varmap.all_vars().len());
}

#[test]
fn test_predict_returns_one_prediction_per_sample() {
    let ds = dataset(5);
    let splits = DatasetSplits { train: ds.clone(), val: ds.clone(), test: ds };
    let session = RunSession::new(run_config(1), splits, Device::Cpu).unwrap();
    let loaders = session.loaders(0, 0, 1);
    let group = LocalGroup;
    let trainer = Trainer::new(&session.model, &session.varmap, 1e-3, Device::Cpu, &group).unwrap();

    let out = trainer.predict(&loaders.test).unwrap();
    assert_eq!(out.preds.len(), 5);
    assert_eq!(out.targets, vec![5.0, 5.5, 6.0, 6.5, 7.0]);
    assert!(out.loss > 0.0);
}

/// Predicts a single learned constant and starts failing with a tensor
/// error once it has run `healthy_calls` forward passes, like a device that
/// runs out of memory partway through training.
struct FlakyModel {
    w: Tensor,
    healthy_calls: usize,
    calls: Cell<usize>,
}

impl FlakyModel {
    fn new(varmap: &VarMap, healthy_calls: usize) -> Self {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints((1, 1), "w", Init::Const(0.0)).unwrap();
        Self { w, healthy_calls, calls: Cell::new(0) }
    }
}

impl BindingModel for FlakyModel {
    fn forward(&self, _pro: &GraphBatch, lig: &GraphBatch, _train: bool) -> affinyx_models::Result<Tensor> {
        let n = self.calls.get();
        self.calls.set(n + 1);
        if n >= self.healthy_calls {
            return Err(ModelError::Tensor(candle_core::Error::Msg("simulated device failure".into())));
        }
        let ones = Tensor::ones((lig.num_graphs, 1), DType::F32, &Device::Cpu)?;
        Ok(ones.broadcast_mul(&self.w)?)
    }
}

/// A model that rejects its input, as a branch does when a required table is missing.
struct RejectingModel;

impl BindingModel for RejectingModel {
    fn forward(&self, _pro: &GraphBatch, _lig: &GraphBatch, _train: bool) -> affinyx_models::Result<Tensor> {
        Err(ModelError::InvalidGraph("edge attributes are required".into()))
    }
}

fn current_w(varmap: &VarMap) -> f32 {
    let data = varmap.data().lock().unwrap();
    data["w"].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
}

#[test]
fn test_batch_error_aborts_with_sentinel() {
    let varmap = VarMap::new();
    let model = FlakyModel::new(&varmap, 0);
    let loader = DataLoader::new(dataset(4), 2);

    let group = LocalGroup;
    let mut trainer = Trainer::new(&model, &varmap, 1e-3, Device::Cpu, &group).unwrap();
    let (outcome, log) = trainer.fit(&loader, &loader, 5, None, |_| {}).unwrap();

    match outcome {
        RunOutcome::Aborted { epoch, loss, error } => {
            assert_eq!(epoch, 0);
            assert_eq!(loss, SENTINEL_LOSS);
            assert!(error.contains("simulated device failure"));
        }
        other => panic!("expected an aborted run, got {other:?}"),
    }
    assert!(log.epochs.is_empty());
}

#[test]
fn test_failure_mid_run_keeps_earlier_epochs_and_best_state() {
    let tmp = tempfile::tempdir().unwrap();
    let varmap = VarMap::new();
    // 4 samples in batches of 2: two training and two validation passes per epoch
    let model = FlakyModel::new(&varmap, 8);
    let loader = DataLoader::new(dataset(4), 2);

    let path = tmp.path().join("flaky.model");
    let mut saver = CheckpointSaver::new(varmap.clone(), &path, 0.0, 1000, Retention::Best, 0);
    let group = LocalGroup;
    let mut trainer = Trainer::new(&model, &varmap, 0.1, Device::Cpu, &group).unwrap();

    let mut weights = Vec::new();
    let (outcome, log) = trainer
        .fit(&loader, &loader, 5, Some(&mut saver), |r| weights.push((r.epoch, current_w(&varmap))))
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Aborted { epoch: 2, loss, .. } if loss == SENTINEL_LOSS));
    assert_eq!(log.epochs.iter().map(|r| r.epoch).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(weights.len(), 2);
    assert_eq!(model.calls.get(), 9);

    let best = saver.best_epoch().unwrap();
    assert!(best <= 1);
    saver.save().unwrap();
    let (meta, state) = checkpoint::read_checkpoint(&path, &Device::Cpu).unwrap();
    assert_eq!(meta.epoch, Some(best));
    let saved = state["w"].flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
    assert_eq!(saved, weights[best].1);
}

#[test]
fn test_saving_each_improvement_leaves_best_checkpoint_after_abort() {
    let tmp = tempfile::tempdir().unwrap();
    let varmap = VarMap::new();
    let model = FlakyModel::new(&varmap, 8);
    let loader = DataLoader::new(dataset(4), 2);

    let path = tmp.path().join("trial").join("model.checkpoint");
    let mut saver =
        CheckpointSaver::new(varmap.clone(), &path, 0.0, 1000, Retention::Best, 0).save_each_improvement();
    let group = LocalGroup;
    let mut trainer = Trainer::new(&model, &varmap, 0.1, Device::Cpu, &group).unwrap();

    let mut weights = Vec::new();
    let (outcome, _) = trainer
        .fit(&loader, &loader, 5, Some(&mut saver), |_| weights.push(current_w(&varmap)))
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Aborted { epoch: 2, .. }));

    // written during training, with no final save
    let (meta, state) = checkpoint::read_checkpoint(&path, &Device::Cpu).unwrap();
    let best = saver.best_epoch().unwrap();
    assert_eq!(meta.epoch, Some(best));
    let saved = state["w"].flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
    assert_eq!(saved, weights[best]);
    assert!(!saver.tmp_path().exists());
}

#[test]
fn test_non_runtime_errors_are_returned() {
    let varmap = VarMap::new();
    let loader = DataLoader::new(dataset(4), 2);
    let group = LocalGroup;
    let model = RejectingModel;
    let mut trainer = Trainer::new(&model, &varmap, 1e-3, Device::Cpu, &group).unwrap();

    let err = trainer.fit(&loader, &loader, 3, None, |_| {}).unwrap_err();
    assert!(!err.is_runtime());
    assert!(err.to_string().contains("edge attributes are required"));
}

#[test]
fn test_empty_validation_set_is_an_error() {
    let varmap = VarMap::new();
    let model = FlakyModel::new(&varmap, usize::MAX);
    let train = DataLoader::new(dataset(4), 2);
    let val = DataLoader::new(Arc::new(AffinityDataset::default()), 2);
    let group = LocalGroup;
    let mut trainer = Trainer::new(&model, &varmap, 1e-3, Device::Cpu, &group).unwrap();

    let mut reported = Vec::new();
    let err = trainer.fit(&train, &val, 2, None, |r| reported.push(r.val_loss)).unwrap_err();
    assert!(err.to_string().contains("no samples"), "{err}");
    assert!(reported.is_empty());
}

#[test]
fn test_mixed_optional_tables_are_rejected_before_training() {
    let mut samples = dataset(4).samples().to_vec();
    let edges = samples[0].protein.num_edges();
    samples[0].protein.edge_weight = Some(vec![1.0; edges]);
    let err = AffinityDataset::new(samples).unwrap_err();
    assert!(err.to_string().contains("optional tables"), "{err}");
}
