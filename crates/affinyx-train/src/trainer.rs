//! The training and evaluation loop.

use std::time::Instant;

use affinyx_models::BindingModel;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::dataset::{Batch, DataLoader};
use crate::distributed::ProcessGroup;
use crate::error::{Result, TrainError};
use crate::saver::CheckpointSaver;

/// Loss reported for a run that died on a batch error, large enough that a
/// minimising search never prefers it.
pub const SENTINEL_LOSS: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
}

/// Per-epoch losses of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingLog {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingLog {
    pub fn record_epoch(&mut self, record: EpochRecord) {
        if self.best_val_loss.is_none_or(|best| record.val_loss < best) {
            self.best_val_loss = Some(record.val_loss);
            self.best_epoch = Some(record.epoch);
        }
        self.epochs.push(record);
    }

    pub fn last_val_loss(&self) -> Option<f64> {
        self.epochs.last().map(|r| r.val_loss)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { epochs_run: usize, stopped_early: bool },
    /// A batch failed; the remaining epochs were skipped.
    Aborted { epoch: usize, loss: f64, error: String },
}

impl RunOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RunOutcome::Aborted { .. })
    }
}

/// Predictions over a whole loader.
#[derive(Debug, Clone, Default)]
pub struct Predictions {
    pub loss: f64,
    pub preds: Vec<f64>,
    pub targets: Vec<f64>,
}

pub struct Trainer<'a, M: BindingModel> {
    model: &'a M,
    vars: Vec<(String, Var)>,
    optimizer: AdamW,
    device: Device,
    group: &'a dyn ProcessGroup,
}

impl<'a, M: BindingModel> Trainer<'a, M> {
    /// `varmap` must hold exactly the parameters of `model`.
    pub fn new(model: &'a M, varmap: &VarMap, lr: f64, device: Device, group: &'a dyn ProcessGroup) -> Result<Self> {
        let mut vars: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|_| TrainError::Group("parameter store lock poisoned".into()))?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // every rank must reduce gradients in the same order
        vars.sort_by(|a, b| a.0.cmp(&b.0));

        let params = ParamsAdamW { lr, weight_decay: 0.0, ..Default::default() };
        let optimizer = AdamW::new(vars.iter().map(|(_, v)| v.clone()).collect(), params)?;
        Ok(Self { model, vars, optimizer, device, group })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn batch_loss(&self, batch: &Batch, train: bool) -> Result<(Tensor, Tensor)> {
        let pred = self.model.forward(&batch.protein, &batch.ligand, train)?;
        let loss = candle_nn::loss::mse(&pred, &batch.y)?;
        Ok((pred, loss))
    }

    /// Sum every gradient across ranks and divide by the world size.
    fn sync_gradients(&self, grads: &mut candle_core::backprop::GradStore) -> Result<()> {
        let world = self.group.world_size();
        if world <= 1 {
            return Ok(());
        }
        for (_, var) in &self.vars {
            let grad = match grads.get(var) {
                Some(g) => g.clone(),
                None => var.zeros_like()?,
            };
            let mut flat = grad.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?;
            self.group.all_reduce_sum(&mut flat)?;
            let avg = (Tensor::from_vec(flat, grad.dims(), &self.device)? / world as f64)?;
            grads.insert(var, avg.to_dtype(var.dtype())?);
        }
        Ok(())
    }

    /// One pass over `loader` with an optimizer step per batch. Returns the
    /// mean training loss.
    pub fn train_epoch(&mut self, loader: &DataLoader, epoch: usize) -> Result<f64> {
        let mut total = 0.0;
        let mut seen = 0usize;
        for indices in loader.batches(epoch) {
            let batch = loader.collate(&indices, &self.device)?;
            let (_, loss) = self.batch_loss(&batch, true)?;
            let mut grads = loss.backward()?;
            self.sync_gradients(&mut grads)?;
            self.optimizer.step(&grads)?;

            total += loss.to_scalar::<f32>()? as f64 * batch.size as f64;
            seen += batch.size;
        }
        Ok(if seen == 0 { 0.0 } else { total / seen as f64 })
    }

    /// Mean loss, predictions and targets over `loader`, without gradients.
    pub fn predict(&self, loader: &DataLoader) -> Result<Predictions> {
        let mut out = Predictions::default();
        let mut total = 0.0;
        for indices in loader.batches(0) {
            let batch = loader.collate(&indices, &self.device)?;
            let (pred, loss) = self.batch_loss(&batch, false)?;
            total += loss.detach().to_scalar::<f32>()? as f64 * batch.size as f64;
            out.preds.extend(pred.detach().flatten_all()?.to_vec1::<f32>()?.into_iter().map(f64::from));
            out.targets.extend(batch.y.flatten_all()?.to_vec1::<f32>()?.into_iter().map(f64::from));
        }
        if out.targets.is_empty() {
            return Err(TrainError::Data("cannot evaluate a loader with no samples".into()));
        }
        out.loss = total / out.targets.len() as f64;
        Ok(out)
    }

    /// Mean validation loss, averaged across ranks so that every rank takes
    /// the same early-stopping decision.
    pub fn evaluate(&self, loader: &DataLoader) -> Result<f64> {
        let local = self.predict(loader)?.loss;
        let world = self.group.world_size();
        if world <= 1 {
            return Ok(local);
        }
        let mut buf = [local as f32];
        self.group.all_reduce_sum(&mut buf)?;
        Ok(buf[0] as f64 / world as f64)
    }

    fn run_epoch(&mut self, train: &DataLoader, val: &DataLoader, epoch: usize) -> Result<EpochRecord> {
        let train_loss = self.train_epoch(train, epoch)?;
        let val_loss = self.evaluate(val)?;
        Ok(EpochRecord { epoch, train_loss, val_loss })
    }

    /// Train for up to `epochs` epochs.
    ///
    /// A tensor failure inside an epoch (forward, backward, gradient sync,
    /// optimizer step or validation) ends the run with [`RunOutcome::Aborted`]
    /// carrying [`SENTINEL_LOSS`]; it is logged, not returned. Any other error
    /// (malformed data, process group, saver I/O) is returned. `on_epoch` sees
    /// every completed epoch.
    pub fn fit(
        &mut self,
        train: &DataLoader,
        val: &DataLoader,
        epochs: usize,
        mut saver: Option<&mut CheckpointSaver>,
        mut on_epoch: impl FnMut(&EpochRecord),
    ) -> Result<(RunOutcome, TrainingLog)> {
        let start = Instant::now();
        let mut log = TrainingLog::default();
        let mut stopped_early = false;

        for epoch in 0..epochs {
            let record = match self.run_epoch(train, val, epoch) {
                Ok(r) => r,
                Err(e) if e.is_runtime() => {
                    error!("Epoch {epoch} failed, aborting run: {e}");
                    log.total_training_time_secs = start.elapsed().as_secs_f64();
                    let outcome = RunOutcome::Aborted { epoch, loss: SENTINEL_LOSS, error: e.to_string() };
                    return Ok((outcome, log));
                }
                Err(e) => return Err(e),
            };
            debug!(
                epoch,
                train_loss = record.train_loss,
                val_loss = record.val_loss,
                "epoch done"
            );
            log.record_epoch(record);
            on_epoch(&record);

            if let Some(saver) = saver.as_deref_mut() {
                let stop = saver.update(record.val_loss)?;
                if saver.improved_last() {
                    saver.save_improvement()?;
                }
                if stop {
                    info!("Early stopping at epoch {epoch} (best {:?})", saver.best_metric());
                    stopped_early = true;
                    break;
                }
            }
        }

        log.total_training_time_secs = start.elapsed().as_secs_f64();
        let outcome = RunOutcome::Completed { epochs_run: log.epochs.len(), stopped_early };
        Ok((outcome, log))
    }
}
