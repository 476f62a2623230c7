//! Geometric vector perceptrons (Jing et al., 2021).
//!
//! Features come in pairs: scalars `[N, S]` and 3D vectors `[N, V, 3]`.
//! Vectors are only ever mixed along the channel axis and rescaled by
//! functions of their norms, so the layers stay rotation-equivariant.

use candle_core::{Module, Tensor, D};
use candle_nn::{layer_norm, linear, linear_no_bias, Dropout, LayerNorm, Linear, VarBuilder};

use crate::graph::GraphBatch;
use crate::layers::{global_mean_pool, scatter_mean, Mlp};
use crate::{ModelError, Result};

const NORM_EPS: f64 = 1e-8;

/// Width of a scalar/vector feature pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    pub s: usize,
    pub v: usize,
}

impl Dims {
    pub const fn new(s: usize, v: usize) -> Self {
        Self { s, v }
    }
}

/// L2 norm over `dim`, clamped away from zero.
fn norm_no_nan(x: &Tensor, dim: D, keepdim: bool) -> Result<Tensor> {
    let sq = if keepdim { x.sqr()?.sum_keepdim(dim)? } else { x.sqr()?.sum(dim)? };
    Ok(sq.clamp(NORM_EPS, f64::MAX)?.sqrt()?)
}

/// One geometric vector perceptron.
#[derive(Debug, Clone)]
pub struct Gvp {
    wh: Linear,
    ws: Linear,
    wv: Option<Linear>,
    scalar_act: bool,
    vector_gate: bool,
}

impl Gvp {
    pub fn new(input: Dims, output: Dims, activations: bool, vb: VarBuilder) -> Result<Self> {
        if input.v == 0 {
            return Err(ModelError::ModelLoad("GVP needs at least one input vector channel".into()));
        }
        let h = input.v.max(output.v);
        let wh = linear_no_bias(input.v, h, vb.pp("wh"))?;
        let ws = linear(input.s + h, output.s, vb.pp("ws"))?;
        let wv = if output.v > 0 {
            Some(linear_no_bias(h, output.v, vb.pp("wv"))?)
        } else {
            None
        };
        Ok(Self { wh, ws, wv, scalar_act: activations, vector_gate: activations })
    }

    /// `s: [N, S_in]`, `v: [N, V_in, 3]` -> `([N, S_out], [N, V_out, 3])`.
    pub fn forward(&self, s: &Tensor, v: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        let vt = v.transpose(1, 2)?.contiguous()?;
        let vh = self.wh.forward(&vt)?; // [N, 3, h]
        let vn = norm_no_nan(&vh, D::Minus2, false)?;

        let mut s_out = self.ws.forward(&Tensor::cat(&[s, &vn], D::Minus1)?)?;
        if self.scalar_act {
            s_out = s_out.relu()?;
        }

        let v_out = match &self.wv {
            Some(wv) => {
                let mut out = wv.forward(&vh)?.transpose(1, 2)?.contiguous()?; // [N, V_out, 3]
                if self.vector_gate {
                    let gate = candle_nn::ops::sigmoid(&norm_no_nan(&out, D::Minus1, true)?)?;
                    out = out.broadcast_mul(&gate)?;
                }
                Some(out)
            }
            None => None,
        };
        Ok((s_out, v_out))
    }

    /// Like [`forward`](Self::forward) but for layers that must keep vectors.
    fn forward_pair(&self, s: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        match self.forward(s, v)? {
            (s, Some(v)) => Ok((s, v)),
            (_, None) => Err(ModelError::ModelLoad("GVP layer produced no vector channels".into())),
        }
    }
}

/// Layer norm on scalars; vectors are scaled to unit mean squared norm.
#[derive(Debug, Clone)]
pub struct GvpLayerNorm {
    scalar: LayerNorm,
}

impl GvpLayerNorm {
    pub fn new(dims: Dims, vb: VarBuilder) -> Result<Self> {
        Ok(Self { scalar: layer_norm(dims.s, 1e-5, vb.pp("scalar"))? })
    }

    pub fn forward(&self, s: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let s = self.scalar.forward(s)?;
        let sq = v.sqr()?.sum_keepdim(D::Minus1)?.clamp(NORM_EPS, f64::MAX)?;
        let rms = sq.mean_keepdim(D::Minus2)?.sqrt()?;
        Ok((s, v.broadcast_div(&rms)?))
    }
}

/// Message passing with GVP messages, mean aggregation and a GVP
/// feed-forward block, each wrapped in residual + norm.
#[derive(Debug, Clone)]
pub struct GvpConvLayer {
    message: Gvp,
    ff_in: Gvp,
    ff_out: Gvp,
    norm0: GvpLayerNorm,
    norm1: GvpLayerNorm,
    dropout: Dropout,
}

impl GvpConvLayer {
    pub fn new(node: Dims, edge: Dims, drop_rate: f64, vb: VarBuilder) -> Result<Self> {
        let msg_in = Dims::new(2 * node.s + edge.s, 2 * node.v + edge.v);
        let hidden = Dims::new(4 * node.s, 2 * node.v);
        Ok(Self {
            message: Gvp::new(msg_in, node, true, vb.pp("message"))?,
            ff_in: Gvp::new(node, hidden, true, vb.pp("ff_in"))?,
            ff_out: Gvp::new(hidden, node, false, vb.pp("ff_out"))?,
            norm0: GvpLayerNorm::new(node, vb.pp("norm0"))?,
            norm1: GvpLayerNorm::new(node, vb.pp("norm1"))?,
            dropout: Dropout::new(drop_rate as f32),
        })
    }

    pub fn forward(
        &self,
        s: &Tensor,
        v: &Tensor,
        edge_s: &Tensor,
        edge_v: &Tensor,
        g: &GraphBatch,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let ms = Tensor::cat(&[&s.index_select(&g.src, 0)?, edge_s, &s.index_select(&g.dst, 0)?], 1)?;
        let mv = Tensor::cat(&[&v.index_select(&g.src, 0)?, edge_v, &v.index_select(&g.dst, 0)?], 1)?;
        let (ms, mv) = self.message.forward_pair(&ms, &mv)?;
        let ds = scatter_mean(&ms, &g.dst, g.num_nodes)?;
        let dv = scatter_mean(&mv, &g.dst, g.num_nodes)?;

        let (s, v) = self.norm0.forward(&(s + self.dropout.forward(&ds, train)?)?, &(v + dv)?)?;

        let (hs, hv) = self.ff_in.forward_pair(&s, &v)?;
        let (ds, dv) = self.ff_out.forward_pair(&hs, &hv)?;
        self.norm1.forward(&(s + self.dropout.forward(&ds, train)?)?, &(v + dv)?)
    }
}

/// Hyperparameters of a GVP graph branch.
#[derive(Debug, Clone, Copy)]
pub struct GvpBranchConfig {
    pub node_in: Dims,
    pub edge_in: Dims,
    pub node_h: Dims,
    pub edge_h: Dims,
    pub num_layers: usize,
    pub drop_rate: f64,
    pub final_out: usize,
}

/// Embed, run `num_layers` GVP convolutions, project to scalars, pool,
/// then a two-layer MLP to `final_out`.
#[derive(Debug, Clone)]
pub struct GvpBranch {
    w_v_norm: GvpLayerNorm,
    w_v: Gvp,
    w_e_norm: GvpLayerNorm,
    w_e: Gvp,
    layers: Vec<GvpConvLayer>,
    w_out_norm: GvpLayerNorm,
    w_out: Gvp,
    dense: Mlp,
}

impl GvpBranch {
    pub fn new(cfg: GvpBranchConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.num_layers)
            .map(|i| GvpConvLayer::new(cfg.node_h, cfg.edge_h, cfg.drop_rate, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let ns = cfg.node_h.s;
        Ok(Self {
            w_v_norm: GvpLayerNorm::new(cfg.node_in, vb.pp("w_v_norm"))?,
            w_v: Gvp::new(cfg.node_in, cfg.node_h, false, vb.pp("w_v"))?,
            w_e_norm: GvpLayerNorm::new(cfg.edge_in, vb.pp("w_e_norm"))?,
            w_e: Gvp::new(cfg.edge_in, cfg.edge_h, false, vb.pp("w_e"))?,
            layers,
            w_out_norm: GvpLayerNorm::new(cfg.node_h, vb.pp("w_out_norm"))?,
            w_out: Gvp::new(cfg.node_h, Dims::new(ns, 0), true, vb.pp("w_out"))?,
            dense: Mlp::new(&[ns, 2 * ns, cfg.final_out], cfg.drop_rate, 1, false, vb.pp("dense"))?,
        })
    }

    /// Returns graph embeddings `[B, final_out]`.
    pub fn forward(&self, g: &GraphBatch, train: bool) -> Result<Tensor> {
        let (node_v, edge_s, edge_v) = g.require_vectors()?;

        let (s, v) = self.w_v_norm.forward(&g.x, node_v)?;
        let (mut s, mut v) = self.w_v.forward_pair(&s, &v)?;
        let (es, ev) = self.w_e_norm.forward(edge_s, edge_v)?;
        let (es, ev) = self.w_e.forward_pair(&es, &ev)?;

        for layer in &self.layers {
            (s, v) = layer.forward(&s, &v, &es, &ev, g, train)?;
        }

        let (s, v) = self.w_out_norm.forward(&s, &v)?;
        let (out, _) = self.w_out.forward(&s, &v)?;
        let pooled = global_mean_pool(&out, g)?;
        self.dense.forward(&pooled, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_graphs::vector_graph;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn rotate_z(v: &Tensor) -> Tensor {
        // 90 degrees about z: (x, y, z) -> (-y, x, z)
        let r = Tensor::new(&[[0f32, 1., 0.], [-1., 0., 0.], [0., 0., 1.]], &Device::Cpu).unwrap();
        v.broadcast_matmul(&r).unwrap()
    }

    #[test]
    fn test_gvp_scalars_are_rotation_invariant() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gvp = Gvp::new(Dims::new(2, 2), Dims::new(3, 2), true, vb).unwrap();

        let s = Tensor::new(&[[0.5f32, -1.0]], &Device::Cpu).unwrap();
        let v = Tensor::new(&[[[1f32, 2., 3.], [0., -1., 0.5]]], &Device::Cpu).unwrap();

        let (s1, v1) = gvp.forward(&s, &v).unwrap();
        let (s2, v2) = gvp.forward(&s, &rotate_z(&v)).unwrap();

        let diff = (s1 - s2).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-5);

        let rotated_out = rotate_z(&v1.unwrap());
        let diff = (rotated_out - v2.unwrap()).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_gvp_without_vector_output() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gvp = Gvp::new(Dims::new(2, 1), Dims::new(4, 0), true, vb).unwrap();
        let s = Tensor::zeros((5, 2), DType::F32, &Device::Cpu).unwrap();
        let v = Tensor::ones((5, 1, 3), DType::F32, &Device::Cpu).unwrap();
        let (s, v) = gvp.forward(&s, &v).unwrap();
        assert_eq!(s.dims(), &[5, 4]);
        assert!(v.is_none());
    }

    #[test]
    fn test_branch_output_shape() {
        let g = vector_graph(4, 6, 1, 5, 1);
        let batch = GraphBatch::collate(&[&g, &g, &g], &Device::Cpu).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let branch = GvpBranch::new(
            GvpBranchConfig {
                node_in: Dims::new(6, 1),
                edge_in: Dims::new(5, 1),
                node_h: Dims::new(8, 2),
                edge_h: Dims::new(4, 1),
                num_layers: 2,
                drop_rate: 0.1,
                final_out: 7,
            },
            vb,
        )
        .unwrap();
        let out = branch.forward(&batch, false).unwrap();
        assert_eq!(out.dims(), &[3, 7]);
    }
}
