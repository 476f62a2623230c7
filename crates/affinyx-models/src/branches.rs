//! Ligand and protein graph branches. Each maps a [`GraphBatch`] to one
//! embedding row per graph.

use candle_core::{Module, Tensor, D};
use candle_nn::{linear, linear_no_bias, Dropout, Linear, VarBuilder};

use crate::graph::GraphBatch;
use crate::gvp::GvpBranch;
use crate::layers::{global_mean_pool, scatter_softmax, scatter_sum, GcnStack, Mlp};
use crate::Result;

/// A graph encoder producing `[B, out]` embeddings.
pub trait Branch {
    fn forward(&self, g: &GraphBatch, train: bool) -> Result<Tensor>;
}

impl Branch for GvpBranch {
    fn forward(&self, g: &GraphBatch, train: bool) -> Result<Tensor> {
        GvpBranch::forward(self, g, train)
    }
}

/// GCN ligand encoder: three convolutions widening `in -> in -> 2in -> 4in`,
/// mean pooling, then `4in -> 1024 -> out`.
#[derive(Debug, Clone)]
pub struct GcnLigandBranch {
    gcn: GcnStack,
    fc: Mlp,
}

impl GcnLigandBranch {
    pub fn new(num_features: usize, output_dim: usize, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let gcn = GcnStack::new(num_features, num_features, 0.0, false, vb.clone())?;
        let fc = Mlp::new(&[gcn.out_dim(num_features), 1024, output_dim], dropout, 2, true, vb)?;
        Ok(Self { gcn, fc })
    }
}

impl Branch for GcnLigandBranch {
    fn forward(&self, g: &GraphBatch, train: bool) -> Result<Tensor> {
        let pooled = self.gcn.forward(g, &g.x, train)?;
        self.fc.forward(&pooled, train)
    }
}

/// Ligand encoder over pooled chemical language model embeddings. `dims`
/// runs from the embedding width to the output width; every layer but the
/// last is ReLU-activated and the first two are followed by dropout.
#[derive(Debug, Clone)]
pub struct ChemLigandBranch {
    fc: Mlp,
}

impl ChemLigandBranch {
    pub fn new(dims: &[usize], dropout: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self { fc: Mlp::new(dims, dropout, 2, false, vb)? })
    }
}

impl Branch for ChemLigandBranch {
    fn forward(&self, g: &GraphBatch, train: bool) -> Result<Tensor> {
        self.fc.forward(g.require_lm_emb()?, train)
    }
}

/// GCN protein encoder with a fixed embedding width so every protein
/// feature set yields a branch of the same size.
#[derive(Debug, Clone)]
pub struct GcnProteinBranch {
    gcn: GcnStack,
    fc: Mlp,
}

impl GcnProteinBranch {
    pub const EMB: usize = 54;

    pub fn new(
        num_features: usize,
        emb: usize,
        output_dim: usize,
        dropout: f64,
        use_weights: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let gcn = GcnStack::new(num_features, emb, 0.0, use_weights, vb.clone())?;
        // fc1 -> relu -> dropout -> fc2 -> dropout
        let fc = Mlp::new(&[gcn.out_dim(emb), 1024, output_dim], dropout, 2, false, vb)?;
        Ok(Self { gcn, fc })
    }
}

impl Branch for GcnProteinBranch {
    fn forward(&self, g: &GraphBatch, train: bool) -> Result<Tensor> {
        let pooled = self.gcn.forward(g, &g.x, train)?;
        self.fc.forward(&pooled, train)
    }
}

/// Protein encoder over residue embeddings from a protein language model.
#[derive(Debug, Clone)]
pub struct EsmBranch {
    gcn: GcnStack,
    fc: Mlp,
}

impl EsmBranch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_features: usize,
        emb_dim: usize,
        output_dim: usize,
        dropout: f64,
        dropout_gnn: f64,
        extra_fc_lyr: bool,
        use_weights: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let gcn = GcnStack::new(num_features, emb_dim, dropout_gnn, use_weights, vb.clone())?;
        let dims: Vec<usize> = if extra_fc_lyr {
            vec![gcn.out_dim(emb_dim), 1024, output_dim]
        } else {
            vec![gcn.out_dim(emb_dim), output_dim]
        };
        let fc = Mlp::new(&dims, dropout, dims.len() - 1, true, vb)?;
        Ok(Self { gcn, fc })
    }
}

impl Branch for EsmBranch {
    fn forward(&self, g: &GraphBatch, train: bool) -> Result<Tensor> {
        let pooled = self.gcn.forward(g, &g.x, train)?;
        self.fc.forward(&pooled, train)
    }
}

/// Attention convolution over RING3 contact graphs with edge attributes.
///
/// Scores are `a . leaky_relu(W_s x_j + W_d x_i + W_e e_ij)` per head,
/// softmax-normalised over each node's incoming edges (self loops added,
/// shifted by each node's own max), and head outputs are averaged.
#[derive(Debug, Clone)]
pub struct EdgeAttentionConv {
    w_src: Linear,
    w_dst: Linear,
    w_edge: Linear,
    att: Tensor,
    bias: Tensor,
    heads: usize,
    out_dim: usize,
}

impl EdgeAttentionConv {
    pub fn new(in_dim: usize, out_dim: usize, edge_dim: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_src: linear(in_dim, heads * out_dim, vb.pp("lin_l"))?,
            w_dst: linear(in_dim, heads * out_dim, vb.pp("lin_r"))?,
            w_edge: linear_no_bias(edge_dim, heads * out_dim, vb.pp("lin_edge"))?,
            att: vb.get_with_hints((heads, out_dim), "att", candle_nn::init::DEFAULT_KAIMING_NORMAL)?,
            bias: vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?,
            heads,
            out_dim,
        })
    }

    pub fn forward(&self, x: &Tensor, edge_attr: &Tensor, g: &GraphBatch) -> Result<Tensor> {
        let n = g.num_nodes;
        let device = g.device();

        // Self loops carry the mean edge attribute.
        let loops = Tensor::arange(0u32, n as u32, device)?;
        let src = Tensor::cat(&[&g.src, &loops], 0)?;
        let dst = Tensor::cat(&[&g.dst, &loops], 0)?;
        let loop_attr = if g.num_edges() > 0 {
            edge_attr.mean_keepdim(0)?.broadcast_as((n, edge_attr.dim(1)?))?.contiguous()?
        } else {
            Tensor::zeros((n, edge_attr.dim(1)?), edge_attr.dtype(), device)?
        };
        let edge_attr = Tensor::cat(&[edge_attr, &loop_attr], 0)?;
        let e = src.dims1()?;

        let shape = (e, self.heads, self.out_dim);
        let xs = self.w_src.forward(x)?.index_select(&src, 0)?.reshape(shape)?;
        let xd = self.w_dst.forward(x)?.index_select(&dst, 0)?.reshape(shape)?;
        let xe = self.w_edge.forward(&edge_attr)?.reshape(shape)?;

        let h = candle_nn::ops::leaky_relu(&((&xs + xd)? + xe)?, 0.2)?;
        let score = h.broadcast_mul(&self.att.unsqueeze(0)?)?.sum(D::Minus1)?; // [E, heads]

        let alpha = scatter_softmax(&score, &dst, n)?;

        let msg = xs.broadcast_mul(&alpha.unsqueeze(D::Minus1)?)?;
        let out = scatter_sum(&msg, &dst, n)?.mean(1)?;
        Ok(out.broadcast_add(&self.bias)?)
    }
}

/// Protein encoder over RING3 residue interaction graphs.
#[derive(Debug, Clone)]
pub struct Ring3Branch {
    conv1: EdgeAttentionConv,
    conv2: EdgeAttentionConv,
    dropout: Dropout,
    fc: Mlp,
}

impl Ring3Branch {
    pub fn new(
        num_features: usize,
        edge_dim: usize,
        emb_dim: usize,
        output_dim: usize,
        dropout: f64,
        heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            conv1: EdgeAttentionConv::new(num_features, emb_dim, edge_dim, heads, vb.pp("conv1"))?,
            conv2: EdgeAttentionConv::new(emb_dim, emb_dim, edge_dim, heads, vb.pp("conv2"))?,
            dropout: Dropout::new(dropout as f32),
            fc: Mlp::new(&[emb_dim, 1024, output_dim], dropout, 1, false, vb)?,
        })
    }
}

impl Branch for Ring3Branch {
    fn forward(&self, g: &GraphBatch, train: bool) -> Result<Tensor> {
        let edge_attr = g.require_edge_attr()?;
        let h = self.conv1.forward(&g.x, edge_attr, g)?.relu()?;
        let h = self.dropout.forward(&h, train)?;
        let h = self.conv2.forward(&h, edge_attr, g)?.relu()?;
        let pooled = global_mean_pool(&h, g)?;
        self.fc.forward(&pooled, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_graphs::path_graph;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_gcn_protein_branch_parameter_names() {
        let varmap = VarMap::new();
        let _ = GcnProteinBranch::new(10, GcnProteinBranch::EMB, 32, 0.2, false, vb(&varmap).pp("pro_branch")).unwrap();
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        for expected in [
            "pro_branch.conv1.lin.weight",
            "pro_branch.conv3.bias",
            "pro_branch.fc1.weight",
            "pro_branch.fc2.bias",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_esm_branch_shapes() {
        let g = path_graph(5, 12);
        let batch = GraphBatch::collate(&[&g, &g], &Device::Cpu).unwrap();
        for extra in [true, false] {
            let varmap = VarMap::new();
            let branch = EsmBranch::new(12, 8, 16, 0.1, 0.1, extra, false, vb(&varmap)).unwrap();
            assert_eq!(branch.forward(&batch, true).unwrap().dims(), &[2, 16]);
        }
    }

    #[test]
    fn test_chem_ligand_branch_reads_lm_embeddings() {
        let mut g = path_graph(3, 2);
        g.lm_emb = Some(vec![0.5; 6]);
        let batch = GraphBatch::collate(&[&g, &g], &Device::Cpu).unwrap();

        let varmap = VarMap::new();
        let branch = ChemLigandBranch::new(&[6, 16, 8, 4], 0.2, vb(&varmap).pp("lig_branch")).unwrap();
        assert_eq!(branch.forward(&batch, true).unwrap().dims(), &[2, 4]);
        assert!(varmap.data().lock().unwrap().contains_key("lig_branch.fc3.weight"));

        let bare = GraphBatch::collate(&[&path_graph(3, 2)], &Device::Cpu).unwrap();
        assert!(matches!(branch.forward(&bare, false), Err(crate::ModelError::InvalidGraph(_))));
    }

    #[test]
    fn test_ring3_attention_sums_to_one() {
        let mut g = path_graph(4, 3);
        g.edge_attr = Some(vec![vec![1.0, 0.0]; g.num_edges()]);
        let batch = GraphBatch::collate(&[&g], &Device::Cpu).unwrap();

        let varmap = VarMap::new();
        let conv = EdgeAttentionConv::new(3, 4, 2, 3, vb(&varmap)).unwrap();
        let out = conv.forward(&batch.x, batch.edge_attr.as_ref().unwrap(), &batch).unwrap();
        assert_eq!(out.dims(), &[4, 4]);

        let branch = Ring3Branch::new(3, 2, 4, 6, 0.0, 2, vb(&varmap).pp("ring")).unwrap();
        assert_eq!(branch.forward(&batch, false).unwrap().dims(), &[1, 6]);
    }

    #[test]
    fn test_ring3_attention_stays_finite_for_distant_nodes() {
        let mut g = path_graph(4, 3);
        for (i, row) in g.x.iter_mut().enumerate() {
            let scale = if i % 2 == 0 { 1.0e4 } else { -1.0e4 };
            row.iter_mut().for_each(|v| *v = scale * (*v + 1.0));
        }
        g.edge_attr = Some(vec![vec![1.0, 0.0]; g.num_edges()]);
        let batch = GraphBatch::collate(&[&g], &Device::Cpu).unwrap();

        let varmap = VarMap::new();
        let conv = EdgeAttentionConv::new(3, 4, 2, 3, vb(&varmap)).unwrap();
        let out = conv.forward(&batch.x, batch.edge_attr.as_ref().unwrap(), &batch).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()), "{values:?}");
    }

    #[test]
    fn test_ring3_requires_edge_attributes() {
        let g = path_graph(3, 3);
        let batch = GraphBatch::collate(&[&g], &Device::Cpu).unwrap();
        let varmap = VarMap::new();
        let branch = Ring3Branch::new(3, 2, 4, 6, 0.0, 2, vb(&varmap)).unwrap();
        assert!(branch.forward(&batch, false).is_err());
    }
}
