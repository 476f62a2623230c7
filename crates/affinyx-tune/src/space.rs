//! Search spaces: fixed run settings plus sampled hyperparameters.

use std::collections::BTreeMap;

use affinyx_common::{
    ArchParams, DataOpt, LigEdgeOpt, LigFeatOpt, ModelOpt, ProEdgeOpt, ProFeatOpt, RunConfig,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, TuneError};

/// Parameter distribution for random search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamDistribution {
    Uniform { min: f64, max: f64 },
    LogUniform { min: f64, max: f64 },
    Choice { values: Vec<Value> },
}

impl ParamDistribution {
    pub fn choice<T: Into<Value>>(values: impl IntoIterator<Item = T>) -> Self {
        Self::Choice { values: values.into_iter().map(Into::into).collect() }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> Value {
        match self {
            Self::Uniform { min, max } => json!(uniform(rng, *min, *max)),
            Self::LogUniform { min, max } => json!(uniform(rng, min.ln(), max.ln()).exp()),
            Self::Choice { values } => values.choose(rng).cloned().unwrap_or(Value::Null),
        }
    }
}

fn uniform<R: Rng>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max > min {
        rng.gen_range(min..max)
    } else {
        min
    }
}

/// One sampled point: the raw parameter values and the run they describe.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub params: BTreeMap<String, Value>,
    pub config: RunConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    /// Settings shared by every trial. Sampled parameters overwrite the
    /// corresponding fields.
    pub base: RunConfig,
    pub params: BTreeMap<String, ParamDistribution>,
}

impl SearchSpace {
    /// The GVPL_ESM search on PDBbind.
    pub fn default_space() -> Self {
        Self::for_model(ModelOpt::GvplEsm)
    }

    /// Shared distributions plus the architecture extras of `model`.
    pub fn for_model(model: ModelOpt) -> Self {
        let base = RunConfig {
            model,
            dataset: DataOpt::PdbBind,
            feature_opt: ProFeatOpt::Nomsa,
            edge_opt: if model.uses_ring3_protein() { ProEdgeOpt::Ring3 } else { ProEdgeOpt::Binary },
            lig_feat_opt: LigFeatOpt::Gvp,
            lig_edge_opt: LigEdgeOpt::Binary,
            fold_selection: Some(0),
            protein_overlap: false,
            batch_size: 32,
            lr: 1e-4,
            epochs: 20,
            arch: ArchParams::default(),
            save_checkpoint: false,
        };

        let mut params = BTreeMap::new();
        let mut add = |name: &str, dist: ParamDistribution| {
            params.insert(name.to_string(), dist);
        };
        add("lr", ParamDistribution::LogUniform { min: 1e-5, max: 1e-3 });
        if model.uses_protein_lm() {
            add("batch_size", ParamDistribution::choice([4, 8, 10]));
        } else {
            add("batch_size", ParamDistribution::choice([16, 32, 64, 128]));
        }
        add("dropout", ParamDistribution::Uniform { min: 0.0, max: 0.5 });
        add("output_dim", ParamDistribution::choice([128, 256, 512]));

        match model {
            ModelOpt::Gvpl => {
                add("num_gvp_layers", ParamDistribution::choice([2, 3, 4]));
            }
            ModelOpt::GvplRng => {
                add("pro_emb_dim", ParamDistribution::choice([64, 128, 256]));
                add("nheads_pro", ParamDistribution::choice([3, 4, 5]));
            }
            ModelOpt::GvplEsm => {
                add("num_gvp_layers", ParamDistribution::choice([2, 3, 4]));
                add("pro_dropout_gnn", ParamDistribution::Uniform { min: 0.0, max: 0.5 });
                add("pro_extra_fc_lyr", ParamDistribution::choice([true, false]));
                add("pro_emb_dim", ParamDistribution::choice([128, 256, 320]));
            }
            _ => {}
        }
        Self { base, params }
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.base.epochs = epochs;
        self
    }

    /// Draw every parameter (in name order) and apply it to the base run.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Result<Sample> {
        let mut config = self.base.clone();
        let mut params = BTreeMap::new();
        for (name, dist) in &self.params {
            let value = dist.sample(rng);
            apply(&mut config, name, &value)?;
            params.insert(name.clone(), value);
        }
        Ok(Sample { params, config })
    }
}

fn invalid(name: &str, value: &Value, expected: &str) -> TuneError {
    TuneError::InvalidParam { name: name.to_string(), reason: format!("expected {expected}, got {value}") }
}

fn as_f64(name: &str, value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| invalid(name, value, "a number"))
}

fn as_usize(name: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| invalid(name, value, "a non-negative integer"))
}

fn as_bool(name: &str, value: &Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| invalid(name, value, "a boolean"))
}

/// Write one sampled parameter into `cfg`.
pub fn apply(cfg: &mut RunConfig, name: &str, value: &Value) -> Result<()> {
    let arch = &mut cfg.arch;
    match name {
        "lr" => cfg.lr = as_f64(name, value)?,
        "batch_size" => cfg.batch_size = as_usize(name, value)?,
        "epochs" => cfg.epochs = as_usize(name, value)?,
        "dropout" => arch.dropout = as_f64(name, value)?,
        "output_dim" => arch.output_dim = Some(as_usize(name, value)?),
        "num_gvp_layers" => arch.num_gvp_layers = Some(as_usize(name, value)?),
        "pro_emb_dim" => arch.pro_emb_dim = Some(as_usize(name, value)?),
        "nheads_pro" => arch.nheads_pro = Some(as_usize(name, value)?),
        "pro_dropout_gnn" => arch.pro_dropout_gnn = Some(as_f64(name, value)?),
        "pro_extra_fc_lyr" => arch.pro_extra_fc_lyr = Some(as_bool(name, value)?),
        "dropout_prot" => arch.dropout_prot = Some(as_f64(name, value)?),
        other => {
            return Err(TuneError::InvalidParam { name: other.to_string(), reason: "unknown parameter".into() })
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn names(space: &SearchSpace) -> Vec<&str> {
        space.params.keys().map(String::as_str).collect()
    }

    #[test]
    fn test_default_space_constants() {
        let space = SearchSpace::default_space();
        let b = &space.base;
        assert_eq!(b.model, ModelOpt::GvplEsm);
        assert_eq!(b.dataset, DataOpt::PdbBind);
        assert_eq!(b.epochs, 20);
        assert_eq!(b.fold_selection, Some(0));
        assert!(!b.save_checkpoint);
        assert_eq!(
            names(&space),
            vec![
                "batch_size",
                "dropout",
                "lr",
                "num_gvp_layers",
                "output_dim",
                "pro_dropout_gnn",
                "pro_emb_dim",
                "pro_extra_fc_lyr"
            ]
        );
    }

    #[test]
    fn test_model_conditioned_extras() {
        assert_eq!(
            names(&SearchSpace::for_model(ModelOpt::GvplRng)),
            vec!["batch_size", "dropout", "lr", "nheads_pro", "output_dim", "pro_emb_dim"]
        );
        assert_eq!(SearchSpace::for_model(ModelOpt::GvplRng).base.edge_opt, ProEdgeOpt::Ring3);
        assert_eq!(
            names(&SearchSpace::for_model(ModelOpt::Gvpl)),
            vec!["batch_size", "dropout", "lr", "num_gvp_layers", "output_dim"]
        );
        assert_eq!(SearchSpace::for_model(ModelOpt::Dg).params.len(), 4);
    }

    #[test]
    fn test_samples_stay_in_range() {
        let space = SearchSpace::default_space();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let s = space.sample(&mut rng).unwrap();
            let c = &s.config;
            assert!((0.99e-5..=1.01e-3).contains(&c.lr), "lr {}", c.lr);
            assert!([4, 8, 10].contains(&c.batch_size));
            assert!((0.0..0.5).contains(&c.arch.dropout));
            assert!([128, 256, 512].contains(&c.arch.output_dim.unwrap()));
            assert!([2, 3, 4].contains(&c.arch.num_gvp_layers.unwrap()));
            assert!([128, 256, 320].contains(&c.arch.pro_emb_dim.unwrap()));
            assert!(c.arch.pro_extra_fc_lyr.is_some());
            c.validate().unwrap();
        }
    }

    #[test]
    fn test_sampling_is_seeded() {
        let space = SearchSpace::default_space();
        let a = space.sample(&mut StdRng::seed_from_u64(3)).unwrap();
        let b = space.sample(&mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut cfg = SearchSpace::default_space().base;
        assert!(apply(&mut cfg, "batch_size", &json!("big")).is_err());
        assert!(apply(&mut cfg, "momentum", &json!(0.9)).is_err());
        apply(&mut cfg, "pro_extra_fc_lyr", &json!(false)).unwrap();
        assert_eq!(cfg.arch.pro_extra_fc_lyr, Some(false));
    }

    #[test]
    fn test_distribution_serde_tag() {
        let d = ParamDistribution::LogUniform { min: 1e-5, max: 1e-3 };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["type"], "log_uniform");
    }
}
