//! Early stopping and best-checkpoint retention.

use std::path::{Path, PathBuf};

use affinyx_common::ModelOpt;
use affinyx_models::checkpoint::{self, CheckpointMeta, StateDict, FORMAT_VERSION};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;

/// Tracks the best value of a minimised metric and when to give up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub min_delta: f64,
    pub patience: usize,
    best: f64,
    counter: usize,
    stopped: bool,
}

impl EarlyStopping {
    pub fn new(min_delta: f64, patience: usize) -> Self {
        Self { min_delta, patience, best: f64::INFINITY, counter: 0, stopped: false }
    }

    /// Record `metric`; returns true if it improved on the best by more than
    /// `min_delta`.
    pub fn observe(&mut self, metric: f64) -> bool {
        let improved = self.best - metric > self.min_delta;
        if improved {
            self.best = metric;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        if self.counter >= self.patience {
            self.stopped = true;
        }
        improved
    }

    /// Latched: once true it stays true.
    pub fn should_stop(&self) -> bool {
        self.stopped
    }

    pub fn best(&self) -> Option<f64> {
        self.best.is_finite().then_some(self.best)
    }

    pub fn counter(&self) -> usize {
        self.counter
    }
}

/// What to keep on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Retention {
    /// Only the best checkpoint.
    Best,
    /// The best checkpoint plus one file per epoch.
    History,
}

/// Decides once per epoch whether the model is a new best, keeps a copy of
/// the best parameters and writes them out on rank 0.
pub struct CheckpointSaver {
    varmap: VarMap,
    path: PathBuf,
    retention: Retention,
    rank: usize,
    stopper: EarlyStopping,
    best_state: Option<StateDict>,
    best_epoch: Option<usize>,
    epochs_seen: usize,
    model_key: String,
    model: Option<ModelOpt>,
    eager: bool,
}

impl CheckpointSaver {
    pub fn new(
        varmap: VarMap,
        path: impl Into<PathBuf>,
        min_delta: f64,
        patience: usize,
        retention: Retention,
        rank: usize,
    ) -> Self {
        let path = path.into();
        let model_key = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            varmap,
            path,
            retention,
            rank,
            stopper: EarlyStopping::new(min_delta, patience),
            best_state: None,
            best_epoch: None,
            epochs_seen: 0,
            model_key,
            model: None,
            eager: false,
        }
    }

    /// Record which run and architecture the checkpoint belongs to.
    pub fn with_provenance(mut self, model_key: impl Into<String>, model: ModelOpt) -> Self {
        self.model_key = model_key.into();
        self.model = Some(model);
        self
    }

    /// Write every new best straight to the destination instead of the
    /// in-progress file, so the checkpoint on disk always matches the best
    /// epoch reported so far.
    pub fn save_each_improvement(mut self) -> Self {
        self.eager = true;
        self
    }

    /// Feed one epoch's validation metric. Returns whether training should stop.
    pub fn update(&mut self, metric: f64) -> Result<bool> {
        let epoch = self.epochs_seen;
        self.epochs_seen += 1;

        if self.stopper.observe(metric) {
            self.best_state = Some(checkpoint::snapshot(&self.varmap)?);
            self.best_epoch = Some(epoch);
            debug!(epoch, metric, "new best");
        } else if self.best_state.is_none() {
            // never end up with nothing to save
            self.best_state = Some(checkpoint::snapshot(&self.varmap)?);
            self.best_epoch = Some(epoch);
        }

        if self.retention == Retention::History && self.rank == 0 {
            let state = checkpoint::snapshot(&self.varmap)?;
            checkpoint::write_checkpoint(&self.epoch_path(epoch), &state, &self.meta(Some(epoch), Some(metric)))?;
        }

        if self.stopper.should_stop() {
            debug!(epoch, counter = self.stopper.counter(), "early stopping");
        }
        Ok(self.stopper.should_stop())
    }

    /// Whether the most recent update was a new best.
    pub fn improved_last(&self) -> bool {
        self.epochs_seen > 0 && self.best_epoch == Some(self.epochs_seen - 1) && self.stopper.counter() == 0
    }

    pub fn should_stop(&self) -> bool {
        self.stopper.should_stop()
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.stopper.best()
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn counter(&self) -> usize {
        self.stopper.counter()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tmp_path(&self) -> PathBuf {
        tmp_path(&self.path)
    }

    fn epoch_path(&self, epoch: usize) -> PathBuf {
        let stem = self.path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let ext = self.path.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_else(|| "model".into());
        self.path.with_file_name(format!("{stem}_e{epoch}.{ext}"))
    }

    fn meta(&self, epoch: Option<usize>, metric: Option<f64>) -> CheckpointMeta {
        CheckpointMeta {
            format_version: FORMAT_VERSION,
            epoch,
            metric,
            model_key: Some(self.model_key.clone()),
            model: self.model,
        }
    }

    fn state_to_write(&self) -> Result<(StateDict, CheckpointMeta)> {
        match &self.best_state {
            Some(state) => Ok((state.clone(), self.meta(self.best_epoch, self.best_metric()))),
            None => Ok((checkpoint::snapshot(&self.varmap)?, self.meta(None, None))),
        }
    }

    /// Write the best parameters (or the current ones, if `update` was never
    /// called) to the destination and drop the in-progress copy. No-op on
    /// ranks other than 0.
    pub fn save(&self) -> Result<()> {
        if self.rank != 0 {
            return Ok(());
        }
        let (state, meta) = self.state_to_write()?;
        checkpoint::write_checkpoint(&self.path, &state, &meta)?;
        let tmp = self.tmp_path();
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
        }
        info!("Saved checkpoint to {}", self.path.display());
        Ok(())
    }

    /// Write the current best to `<destination>_tmp` so an interrupted run
    /// can resume. No-op on ranks other than 0.
    pub fn save_tmp(&self) -> Result<()> {
        if self.rank != 0 {
            return Ok(());
        }
        let (state, meta) = self.state_to_write()?;
        checkpoint::write_checkpoint(&self.tmp_path(), &state, &meta)?;
        Ok(())
    }

    /// Persist a new best: to the destination when saving each improvement,
    /// otherwise to the in-progress file.
    pub fn save_improvement(&self) -> Result<()> {
        if self.eager {
            self.save()
        } else {
            self.save_tmp()
        }
    }
}

/// `<path>_tmp`, e.g. `run.model_tmp`.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push("_tmp");
    path.with_file_name(name)
}

/// Checkpoint to resume from: the canonical file, else the in-progress one.
pub fn resume_path(path: &Path) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }
    let tmp = tmp_path(path);
    tmp.exists().then_some(tmp)
}
