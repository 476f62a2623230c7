//! The closed set of binding-affinity architectures.
//!
//! Every architecture is a ligand branch and a protein branch whose graph
//! embeddings are concatenated and regressed to a single affinity value.

use affinyx_common::{ArchParams, ModelOpt, RunConfig};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::branches::{Branch, ChemLigandBranch, EsmBranch, GcnLigandBranch, GcnProteinBranch, Ring3Branch};
use crate::graph::{GraphBatch, GraphDims};
use crate::gvp::{Dims, GvpBranch, GvpBranchConfig};
use crate::layers::{concat_branches, dense_out, Mlp};
use crate::{ModelError, Result};

/// Predicts binding affinity for a batch of protein/ligand pairs.
pub trait BindingModel {
    /// Returns predictions of shape `[B, 1]`.
    fn forward(&self, pro: &GraphBatch, lig: &GraphBatch, train: bool) -> Result<Tensor>;
}

/// Input widths of both graph families, read off the data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDims {
    pub protein: GraphDims,
    pub ligand: GraphDims,
}

/// Ligand branch, protein branch, regression head.
#[derive(Debug, Clone)]
pub struct TwoBranch<L, P> {
    lig: L,
    pro: P,
    head: Mlp,
}

impl<L: Branch, P: Branch> BindingModel for TwoBranch<L, P> {
    fn forward(&self, pro: &GraphBatch, lig: &GraphBatch, train: bool) -> Result<Tensor> {
        if pro.num_graphs != lig.num_graphs {
            return Err(ModelError::InvalidGraph(format!(
                "{} protein graphs but {} ligand graphs",
                pro.num_graphs, lig.num_graphs
            )));
        }
        let xl = self.lig.forward(lig, train)?;
        let xp = self.pro.forward(pro, train)?;
        self.head.forward(&concat_branches(&xl, &xp)?, train)
    }
}

#[derive(Debug, Clone)]
pub enum AffinityModel {
    /// GCN ligand + GCN protein.
    Dg(TwoBranch<GcnLigandBranch, GcnProteinBranch>),
    /// DG with a wider, edge-weighted protein GCN.
    Dgi(TwoBranch<GcnLigandBranch, GcnProteinBranch>),
    /// GCN ligand + protein language model embeddings.
    Ed(TwoBranch<GcnLigandBranch, EsmBranch>),
    /// GCN ligand + GVP protein.
    Gvp(TwoBranch<GcnLigandBranch, GvpBranch>),
    /// GVP ligand + GCN protein.
    Gvpl(TwoBranch<GvpBranch, GcnProteinBranch>),
    GvplEsm(TwoBranch<GvpBranch, EsmBranch>),
    GvplRng(TwoBranch<GvpBranch, Ring3Branch>),
    /// GCN ligand + RING3 attention protein.
    Rng(TwoBranch<GcnLigandBranch, Ring3Branch>),
    /// Chemical language model ligand + GCN protein.
    Cd(TwoBranch<ChemLigandBranch, GcnProteinBranch>),
    /// Chemical language model ligand + protein language model embeddings.
    Ced(TwoBranch<ChemLigandBranch, EsmBranch>),
}

impl BindingModel for AffinityModel {
    fn forward(&self, pro: &GraphBatch, lig: &GraphBatch, train: bool) -> Result<Tensor> {
        match self {
            Self::Dg(m) | Self::Dgi(m) => m.forward(pro, lig, train),
            Self::Ed(m) => m.forward(pro, lig, train),
            Self::Gvp(m) => m.forward(pro, lig, train),
            Self::Gvpl(m) => m.forward(pro, lig, train),
            Self::GvplEsm(m) => m.forward(pro, lig, train),
            Self::GvplRng(m) => m.forward(pro, lig, train),
            Self::Rng(m) => m.forward(pro, lig, train),
            Self::Cd(m) => m.forward(pro, lig, train),
            Self::Ced(m) => m.forward(pro, lig, train),
        }
    }
}

/// Architecture hyperparameters with per-model defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArch {
    pub dropout: f64,
    pub output_dim: usize,
    pub num_gvp_layers: usize,
    pub pro_emb_dim: usize,
    pub nheads_pro: usize,
    pub pro_dropout_gnn: f64,
    pub pro_extra_fc_lyr: bool,
    pub dropout_prot: f64,
}

impl ResolvedArch {
    pub fn resolve(model: ModelOpt, arch: &ArchParams) -> Self {
        let (output_dim, pro_emb_dim) = match model {
            ModelOpt::Dg | ModelOpt::Ed | ModelOpt::Gvp | ModelOpt::Cd | ModelOpt::Ced => (128, 512),
            ModelOpt::Dgi => (128, 512),
            ModelOpt::Rng | ModelOpt::GvplRng => (250, 128),
            _ => (512, 512),
        };
        Self {
            dropout: arch.dropout,
            output_dim: arch.output_dim.unwrap_or(output_dim),
            num_gvp_layers: arch.num_gvp_layers.unwrap_or(3),
            pro_emb_dim: arch.pro_emb_dim.unwrap_or(pro_emb_dim),
            nheads_pro: arch.nheads_pro.unwrap_or(5),
            pro_dropout_gnn: arch.pro_dropout_gnn.unwrap_or(0.0),
            pro_extra_fc_lyr: arch.pro_extra_fc_lyr.unwrap_or(false),
            dropout_prot: arch.dropout_prot.unwrap_or(0.0),
        }
    }
}

fn gvp_ligand(dims: GraphDims, a: &ResolvedArch, vb: VarBuilder) -> Result<GvpBranch> {
    GvpBranch::new(
        GvpBranchConfig {
            node_in: Dims::new(dims.node, dims.node_v),
            edge_in: Dims::new(dims.edge_attr, dims.edge_v),
            node_h: Dims::new(128, 16),
            edge_h: Dims::new(32, 1),
            num_layers: a.num_gvp_layers,
            drop_rate: a.dropout,
            final_out: a.output_dim,
        },
        vb,
    )
}

fn gvp_protein(dims: GraphDims, a: &ResolvedArch, vb: VarBuilder) -> Result<GvpBranch> {
    GvpBranch::new(
        GvpBranchConfig {
            node_in: Dims::new(dims.node, dims.node_v),
            edge_in: Dims::new(dims.edge_attr, dims.edge_v),
            node_h: Dims::new(6, 3),
            edge_h: Dims::new(32, 1),
            num_layers: 3,
            drop_rate: a.dropout_prot,
            final_out: a.output_dim,
        },
        vb,
    )
}

impl AffinityModel {
    /// Instantiate the architecture named by `cfg.model`, registering its
    /// parameters with `vb`.
    pub fn build(cfg: &RunConfig, dims: FeatureDims, vb: VarBuilder) -> Result<Self> {
        let a = ResolvedArch::resolve(cfg.model, &cfg.arch);
        let weighted = cfg.edge_opt.is_weighted();
        let (pro, lig) = (dims.protein, dims.ligand);
        debug!(model = %cfg.model, ?dims, ?a, "building model");

        let gcn_lig = |vb: VarBuilder| GcnLigandBranch::new(lig.node, a.output_dim, a.dropout, vb);
        let head = |vb: VarBuilder| dense_out(a.output_dim, a.dropout, vb);
        // DGraphDTA-style head: 2*out -> 1024 -> 512 -> 1
        let dg_head = |vb: VarBuilder| Mlp::new(&[2 * a.output_dim, 1024, 512, 1], a.dropout, 2, false, vb);
        let chem_width = || match lig.lm_emb {
            0 => Err(ModelError::InvalidGraph(format!(
                "{} needs ligand language model embeddings; run `affinyx embed --lm ligand`",
                cfg.model
            ))),
            width => Ok(width),
        };

        let model = match cfg.model {
            ModelOpt::Dg => Self::Dg(TwoBranch {
                lig: gcn_lig(vb.pp("lig_branch"))?,
                pro: GcnProteinBranch::new(pro.node, pro.node, a.output_dim, a.dropout, false, vb.pp("pro_branch"))?,
                head: dg_head(vb.pp("head"))?,
            }),
            ModelOpt::Dgi => Self::Dgi(TwoBranch {
                lig: gcn_lig(vb.pp("lig_branch"))?,
                pro: GcnProteinBranch::new(pro.node, a.pro_emb_dim, a.output_dim, a.dropout, weighted, vb.pp("pro_branch"))?,
                head: dg_head(vb.pp("head"))?,
            }),
            ModelOpt::Ed => Self::Ed(TwoBranch {
                lig: gcn_lig(vb.pp("lig_branch"))?,
                pro: EsmBranch::new(
                    pro.node,
                    a.pro_emb_dim,
                    a.output_dim,
                    a.dropout,
                    a.pro_dropout_gnn,
                    a.pro_extra_fc_lyr,
                    weighted,
                    vb.pp("pro_branch"),
                )?,
                head: dg_head(vb.pp("head"))?,
            }),
            ModelOpt::Gvp => Self::Gvp(TwoBranch {
                lig: gcn_lig(vb.pp("lig_branch"))?,
                pro: gvp_protein(pro, &a, vb.pp("pro_branch"))?,
                head: dg_head(vb.pp("head"))?,
            }),
            ModelOpt::Gvpl => Self::Gvpl(TwoBranch {
                lig: gvp_ligand(lig, &a, vb.pp("lig_branch"))?,
                pro: GcnProteinBranch::new(
                    pro.node,
                    GcnProteinBranch::EMB,
                    a.output_dim,
                    a.dropout,
                    weighted,
                    vb.pp("pro_branch"),
                )?,
                head: head(vb.pp("dense_out"))?,
            }),
            ModelOpt::GvplEsm => Self::GvplEsm(TwoBranch {
                lig: gvp_ligand(lig, &a, vb.pp("lig_branch"))?,
                pro: EsmBranch::new(
                    pro.node,
                    a.pro_emb_dim,
                    a.output_dim,
                    a.dropout,
                    a.pro_dropout_gnn,
                    a.pro_extra_fc_lyr,
                    weighted,
                    vb.pp("pro_branch"),
                )?,
                head: head(vb.pp("dense_out"))?,
            }),
            ModelOpt::GvplRng => Self::GvplRng(TwoBranch {
                lig: gvp_ligand(lig, &a, vb.pp("lig_branch"))?,
                pro: Ring3Branch::new(
                    pro.node,
                    pro.edge_attr,
                    a.pro_emb_dim,
                    a.output_dim,
                    a.dropout,
                    a.nheads_pro,
                    vb.pp("pro_branch"),
                )?,
                head: head(vb.pp("dense_out"))?,
            }),
            ModelOpt::Rng => Self::Rng(TwoBranch {
                lig: gcn_lig(vb.pp("lig_branch"))?,
                pro: Ring3Branch::new(
                    pro.node,
                    pro.edge_attr,
                    a.pro_emb_dim,
                    a.output_dim,
                    a.dropout,
                    a.nheads_pro,
                    vb.pp("pro_branch"),
                )?,
                head: head(vb.pp("dense_out"))?,
            }),
            ModelOpt::Cd => Self::Cd(TwoBranch {
                lig: ChemLigandBranch::new(&[chem_width()?, 1024, 512, 256, a.output_dim], a.dropout, vb.pp("lig_branch"))?,
                pro: GcnProteinBranch::new(pro.node, pro.node, a.output_dim, a.dropout, false, vb.pp("pro_branch"))?,
                head: dg_head(vb.pp("head"))?,
            }),
            ModelOpt::Ced => Self::Ced(TwoBranch {
                lig: ChemLigandBranch::new(&[chem_width()?, 1024, a.output_dim], a.dropout, vb.pp("lig_branch"))?,
                pro: EsmBranch::new(
                    pro.node,
                    a.pro_emb_dim,
                    a.output_dim,
                    a.dropout,
                    a.pro_dropout_gnn,
                    a.pro_extra_fc_lyr,
                    false,
                    vb.pp("pro_branch"),
                )?,
                head: dg_head(vb.pp("head"))?,
            }),
            other @ (ModelOpt::Eda | ModelOpt::Edi | ModelOpt::Edai | ModelOpt::Spd) => {
                return Err(ModelError::Unsupported(other.to_string()))
            }
        };
        Ok(model)
    }

    pub fn is_supported(model: ModelOpt) -> bool {
        !matches!(model, ModelOpt::Eda | ModelOpt::Edi | ModelOpt::Edai | ModelOpt::Spd)
    }
}
