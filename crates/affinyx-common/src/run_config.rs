//! The configuration tuple of one training run and the model key derived from it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};
use crate::options::{DataOpt, LigEdgeOpt, LigFeatOpt, ModelOpt, ProEdgeOpt, ProFeatOpt};

/// Architecture hyperparameters. `None` means "use the architecture's default".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchParams {
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default)]
    pub output_dim: Option<usize>,
    #[serde(default)]
    pub num_gvp_layers: Option<usize>,
    #[serde(default)]
    pub pro_emb_dim: Option<usize>,
    #[serde(default)]
    pub nheads_pro: Option<usize>,
    #[serde(default)]
    pub pro_dropout_gnn: Option<f64>,
    #[serde(default)]
    pub pro_extra_fc_lyr: Option<bool>,
    #[serde(default)]
    pub dropout_prot: Option<f64>,
}

fn default_dropout() -> f64 { 0.2 }

impl Default for ArchParams {
    fn default() -> Self {
        Self {
            dropout: default_dropout(),
            output_dim: None,
            num_gvp_layers: None,
            pro_emb_dim: None,
            nheads_pro: None,
            pro_dropout_gnn: None,
            pro_extra_fc_lyr: None,
            dropout_prot: None,
        }
    }
}

/// Everything that identifies a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelOpt,
    pub dataset: DataOpt,
    pub feature_opt: ProFeatOpt,
    pub edge_opt: ProEdgeOpt,
    pub lig_feat_opt: LigFeatOpt,
    pub lig_edge_opt: LigEdgeOpt,
    /// Held-out fold for validation; `None` uses the fixed train/val split.
    #[serde(default)]
    pub fold_selection: Option<u32>,
    #[serde(default)]
    pub protein_overlap: bool,
    /// Per-process batch size.
    pub batch_size: usize,
    pub lr: f64,
    pub epochs: usize,
    #[serde(default)]
    pub arch: ArchParams,
    #[serde(default)]
    pub save_checkpoint: bool,
}

impl RunConfig {
    /// Reject option combinations the data pipeline cannot produce.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CommonError::Incompatible("batch_size must be positive".into()));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(CommonError::Incompatible(format!("invalid learning rate {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.arch.dropout) {
            return Err(CommonError::Incompatible(format!("dropout {} outside [0, 1)", self.arch.dropout)));
        }
        if self.model.uses_gvp_ligand() && !self.lig_feat_opt.requires_sdf() {
            return Err(CommonError::Incompatible(format!(
                "{} needs ligand feature '{}', got '{}'",
                self.model,
                LigFeatOpt::Gvp,
                self.lig_feat_opt
            )));
        }
        if self.model.uses_ring3_protein() && !self.edge_opt.requires_ring3() {
            return Err(CommonError::Incompatible(format!(
                "{} needs a RING3 edge option, got '{}'",
                self.model, self.edge_opt
            )));
        }
        if self.model == ModelOpt::Gvp && self.feature_opt != ProFeatOpt::Gvp {
            return Err(CommonError::Incompatible(format!(
                "{} needs protein feature '{}', got '{}'",
                self.model,
                ProFeatOpt::Gvp,
                self.feature_opt
            )));
        }
        Ok(())
    }

    /// Key for a run whose global batch is `batch_size * world_size`.
    pub fn model_key(&self, world_size: usize) -> ModelKey {
        ModelKey::new(self, self.batch_size * world_size.max(1))
    }
}

/// Deterministic identifier of a run configuration.
///
/// Used as the checkpoint file stem and as the row key of the results tables,
/// so repeated runs of the same configuration overwrite each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey(String);

impl ModelKey {
    pub fn new(cfg: &RunConfig, global_batch: usize) -> Self {
        let mut data = cfg.dataset.to_string();
        if let Some(fold) = cfg.fold_selection {
            data.push_str(&fold.to_string());
        }
        if cfg.protein_overlap {
            data.push_str("-overlap");
        }

        let mut key = format!(
            "{}M_{}D_{}F_{}E_{}B_{}LR_{}D_{}E_{}LF_{}LE",
            cfg.model,
            data,
            cfg.feature_opt,
            cfg.edge_opt,
            global_batch,
            cfg.lr,
            cfg.arch.dropout,
            cfg.epochs,
            cfg.lig_feat_opt,
            cfg.lig_edge_opt,
        );

        // Architecture extras, sorted by parameter name.
        let arch = &cfg.arch;
        let mut extras: BTreeMap<&str, String> = BTreeMap::new();
        if let Some(v) = arch.dropout_prot {
            extras.insert("dropout_prot", format!("{v}DP"));
        }
        if let Some(v) = arch.nheads_pro {
            extras.insert("nheads_pro", format!("{v}NH"));
        }
        if let Some(v) = arch.num_gvp_layers {
            extras.insert("num_gvp_layers", format!("{v}GVPL"));
        }
        if let Some(v) = arch.output_dim {
            extras.insert("output_dim", format!("{v}OD"));
        }
        if let Some(v) = arch.pro_dropout_gnn {
            extras.insert("pro_dropout_gnn", format!("{v}PDG"));
        }
        if let Some(v) = arch.pro_emb_dim {
            extras.insert("pro_emb_dim", format!("{v}PED"));
        }
        if let Some(v) = arch.pro_extra_fc_lyr {
            extras.insert("pro_extra_fc_lyr", if v { "xFC".into() } else { "noxFC".into() });
        }
        for token in extras.values() {
            key.push('_');
            key.push_str(token);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
