//! Seeded random search minimising the reported validation loss.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::error::Result;
use crate::space::SearchSpace;
use crate::trial::{TrialContext, TrialResult};

pub const DEFAULT_NUM_SAMPLES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Completed,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: String,
    pub number: usize,
    pub params: BTreeMap<String, Value>,
    pub status: TrialStatus,
    /// Last reported loss; `None` for errored trials that never reported.
    pub loss: Option<f64>,
    pub reported: Vec<f64>,
    #[serde(default)]
    pub aborted: bool,
    pub error: Option<String>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone)]
pub struct TunerConfig {
    pub experiment: String,
    pub num_samples: usize,
    pub seed: u64,
    /// `<results>/tune`
    pub tune_dir: PathBuf,
}

impl TunerConfig {
    pub fn new(experiment: impl Into<String>, tune_dir: impl Into<PathBuf>) -> Self {
        Self { experiment: experiment.into(), num_samples: DEFAULT_NUM_SAMPLES, seed: 0, tune_dir: tune_dir.into() }
    }
}

/// A finished (or in-progress) search, as written to `<tune dir>/<experiment>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneExperiment {
    pub id: String,
    pub name: String,
    pub metric: String,
    pub mode: String,
    pub seed: u64,
    pub space: SearchSpace,
    pub trials: Vec<TrialRecord>,
    pub best_trial: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TuneExperiment {
    fn new(name: &str, seed: u64, space: SearchSpace) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            metric: "loss".into(),
            mode: "min".into(),
            seed,
            space,
            trials: Vec::new(),
            best_trial: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn push(&mut self, record: TrialRecord) {
        let idx = self.trials.len();
        let better = match (record.loss.filter(|l| l.is_finite()), self.best().and_then(|b| b.loss)) {
            (Some(loss), Some(best)) => loss < best,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if better {
            self.best_trial = Some(idx);
        }
        self.trials.push(record);
        self.updated_at = Utc::now();
    }

    pub fn best(&self) -> Option<&TrialRecord> {
        self.best_trial.and_then(|i| self.trials.get(i))
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.name))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

pub struct Tuner {
    space: SearchSpace,
    config: TunerConfig,
}

impl Tuner {
    pub fn new(space: SearchSpace, config: TunerConfig) -> Self {
        Self { space, config }
    }

    /// Run `num_samples` trials, one after another.
    ///
    /// A trial that returns an error is recorded as [`TrialStatus::Errored`]
    /// and the search moves on. The experiment file is rewritten after every
    /// trial so a killed search keeps what it finished.
    pub fn fit<F>(&self, mut run_trial: F) -> Result<TuneExperiment>
    where
        F: FnMut(&TrialContext, &affinyx_common::RunConfig) -> Result<TrialResult>,
    {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut exp = TuneExperiment::new(&self.config.experiment, self.config.seed, self.space.clone());
        let path = exp.path_in(&self.config.tune_dir);
        info!(
            "Starting search '{}' with {} trials over {} parameters",
            exp.name,
            self.config.num_samples,
            self.space.params.len()
        );

        for number in 0..self.config.num_samples {
            let sample = self.space.sample(&mut rng)?;
            let id = format!("trial_{:04}_{}", number, &uuid::Uuid::new_v4().simple().to_string()[..8]);
            let ctx = TrialContext { dir: self.config.tune_dir.join(&id), id, number };

            let start = Instant::now();
            let record = match run_trial(&ctx, &sample.config) {
                Ok(result) => TrialRecord {
                    id: ctx.id.clone(),
                    number,
                    params: sample.params,
                    status: TrialStatus::Completed,
                    loss: result.last(),
                    reported: result.reported,
                    aborted: result.aborted,
                    error: None,
                    duration_secs: start.elapsed().as_secs_f64(),
                },
                Err(e) => {
                    error!("Trial {} errored: {e}", ctx.id);
                    TrialRecord {
                        id: ctx.id.clone(),
                        number,
                        params: sample.params,
                        status: TrialStatus::Errored,
                        loss: None,
                        reported: Vec::new(),
                        aborted: false,
                        error: Some(e.to_string()),
                        duration_secs: start.elapsed().as_secs_f64(),
                    }
                }
            };
            info!(
                "Trial {}/{} {:?}: loss {:?}",
                number + 1,
                self.config.num_samples,
                record.status,
                record.loss
            );
            exp.push(record);
            exp.save(&path)?;
        }

        match exp.best() {
            Some(best) => info!(
                "Best trial {} with loss {:?}: {}",
                best.id,
                best.loss,
                serde_json::to_string(&best.params)?
            ),
            None => info!("No trial reported a loss"),
        }
        info!("Wrote {}", path.display());
        Ok(exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(loss: Option<f64>) -> TrialRecord {
        TrialRecord {
            id: "t".into(),
            number: 0,
            params: BTreeMap::new(),
            status: if loss.is_some() { TrialStatus::Completed } else { TrialStatus::Errored },
            loss,
            reported: loss.into_iter().collect(),
            aborted: false,
            error: None,
            duration_secs: 0.0,
        }
    }

    #[test]
    fn test_best_ignores_errored_trials() {
        let mut exp = TuneExperiment::new("x", 0, SearchSpace::default_space());
        exp.push(record(None));
        assert_eq!(exp.best_trial, None);
        exp.push(record(Some(2.0)));
        exp.push(record(Some(1.5)));
        exp.push(record(None));
        exp.push(record(Some(1.7)));
        assert_eq!(exp.best_trial, Some(2));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let mut exp = TuneExperiment::new("gvpl_esm", 4, SearchSpace::default_space());
        exp.push(record(Some(0.9)));
        let path = exp.path_in(&tmp.path().join("tune"));
        exp.save(&path).unwrap();

        let loaded = TuneExperiment::load(&path).unwrap();
        assert_eq!(loaded.id, exp.id);
        assert_eq!(loaded.trials, exp.trials);
        assert_eq!(loaded.space, exp.space);
        assert!(!path.with_extension("tmp").exists());
    }
}
