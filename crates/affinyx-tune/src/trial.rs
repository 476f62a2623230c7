//! Training one sampled configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use affinyx_common::{ResultsLayout, RunConfig};
use affinyx_train::{
    load_splits, CheckpointSaver, DatasetSplits, LocalGroup, Retention, RunOutcome, RunSession, Trainer,
};
use candle_core::Device;
use tracing::{debug, warn};

use crate::error::Result;

/// Identity of a trial and where its files go.
#[derive(Debug, Clone)]
pub struct TrialContext {
    pub id: String,
    pub number: usize,
    /// `<results>/tune/<trial id>`
    pub dir: PathBuf,
}

impl TrialContext {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join("model.checkpoint")
    }
}

/// The losses a trial reported, one per epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialResult {
    pub reported: Vec<f64>,
    /// A batch failed and the sentinel was reported as the final loss.
    pub aborted: bool,
}

impl TrialResult {
    /// The trial's metric: its last reported loss.
    pub fn last(&self) -> Option<f64> {
        self.reported.last().copied()
    }
}

/// Trains trials in this process, keeping loaded datasets between trials.
pub struct TrialRunner {
    layout: ResultsLayout,
    device: Device,
    seed: u64,
    splits: HashMap<(PathBuf, Option<u32>, bool), DatasetSplits>,
}

impl TrialRunner {
    pub fn new(layout: ResultsLayout, device: Device, seed: u64) -> Self {
        Self { layout, device, seed, splits: HashMap::new() }
    }

    fn splits(&mut self, cfg: &RunConfig) -> Result<DatasetSplits> {
        let dir = self
            .layout
            .dataset_dir(cfg.dataset, cfg.feature_opt, cfg.edge_opt, cfg.lig_feat_opt, cfg.lig_edge_opt);
        let key = (dir, cfg.fold_selection, cfg.model.uses_pretrained_lm());
        if let Some(s) = self.splits.get(&key) {
            return Ok(s.clone());
        }
        let s = load_splits(&self.layout, cfg)?;
        self.splits.insert(key, s.clone());
        Ok(s)
    }

    /// Train `cfg`, reporting the validation loss after every epoch.
    ///
    /// The checkpoint is rewritten whenever the validation loss improves, so
    /// it always holds the best epoch reported so far. A batch error ends the
    /// trial with the sentinel as its last report. Other errors (bad data, unsupported model, checkpoint I/O) are returned.
    pub fn run(&mut self, ctx: &TrialContext, cfg: &RunConfig) -> Result<TrialResult> {
        let splits = self.splits(cfg)?;
        let session = RunSession::new(cfg.clone(), splits, self.device.clone())?;
        let loaders = session.loaders(self.seed, 0, 1);

        let mut saver = cfg.save_checkpoint.then(|| {
            CheckpointSaver::new(session.varmap.clone(), ctx.checkpoint_path(), 0.0, usize::MAX, Retention::Best, 0)
                .with_provenance(ctx.id.clone(), cfg.model)
                .save_each_improvement()
        });

        let group = LocalGroup;
        let mut trainer = Trainer::new(&session.model, &session.varmap, cfg.lr, self.device.clone(), &group)?;
        let mut result = TrialResult::default();
        let (outcome, _) = trainer.fit(&loaders.train, &loaders.val, cfg.epochs, saver.as_mut(), |r| {
            debug!(trial = ctx.number, epoch = r.epoch, loss = r.val_loss, "report");
            result.reported.push(r.val_loss);
        })?;

        if let RunOutcome::Aborted { loss, error, .. } = outcome {
            warn!("Trial {} hit a runtime error, reporting loss {loss}: {error}", ctx.id);
            result.reported.push(loss);
            result.aborted = true;
        } else if let Some(saver) = &saver {
            saver.save()?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_report_is_the_metric() {
        let r = TrialResult { reported: vec![3.0, 2.5, 2.7], aborted: false };
        assert_eq!(r.last(), Some(2.7));
        assert_eq!(TrialResult::default().last(), None);
    }

    #[test]
    fn test_checkpoint_path() {
        let ctx = TrialContext { id: "abc".into(), number: 0, dir: PathBuf::from("/r/tune/abc") };
        assert_eq!(ctx.checkpoint_path(), PathBuf::from("/r/tune/abc/model.checkpoint"));
    }
}
