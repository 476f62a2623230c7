//! Graph layers and pooling built on Candle tensor ops.

use candle_core::{DType, Module, Tensor, D};
use candle_nn::{linear, linear_no_bias, Dropout, Linear, VarBuilder};

use crate::graph::GraphBatch;
use crate::Result;

/// Symmetric GCN normalisation with self loops.
///
/// Returns `(src, dst, norm)` where `norm[e] = w[e] / sqrt(deg[src] * deg[dst])`
/// and degrees are weighted in-degrees including the self loop.
pub fn gcn_norm(g: &GraphBatch, use_weights: bool) -> Result<(Tensor, Tensor, Tensor)> {
    let device = g.device();
    let n = g.num_nodes;
    let loops = Tensor::arange(0u32, n as u32, device)?;
    let src = Tensor::cat(&[&g.src, &loops], 0)?;
    let dst = Tensor::cat(&[&g.dst, &loops], 0)?;

    let edge_w = if use_weights {
        g.weights_or_ones()?
    } else {
        Tensor::ones(g.num_edges(), DType::F32, device)?
    };
    let w = Tensor::cat(&[&edge_w, &Tensor::ones(n, DType::F32, device)?], 0)?;

    let deg = Tensor::zeros(n, DType::F32, device)?.index_add(&dst, &w, 0)?;
    let dinv = deg.clamp(1e-12f32, f32::MAX)?.powf(-0.5)?;
    let norm = (dinv.index_select(&src, 0)? * &w)?.mul(&dinv.index_select(&dst, 0)?)?;
    Ok((src, dst, norm))
}

/// Sum `values` rows into `size` buckets given by `index`.
pub fn scatter_sum(values: &Tensor, index: &Tensor, size: usize) -> Result<Tensor> {
    let mut shape = values.dims().to_vec();
    shape[0] = size;
    let zeros = Tensor::zeros(shape, values.dtype(), values.device())?;
    Ok(zeros.index_add(index, values, 0)?)
}

/// Mean of `values` rows per bucket; empty buckets stay zero.
pub fn scatter_mean(values: &Tensor, index: &Tensor, size: usize) -> Result<Tensor> {
    let sums = scatter_sum(values, index, size)?;
    let ones = Tensor::ones(index.dims1()?, DType::F32, values.device())?;
    let counts = scatter_sum(&ones, index, size)?.clamp(1f32, f32::MAX)?;
    let mut count_shape = vec![size];
    count_shape.extend(std::iter::repeat(1).take(values.rank() - 1));
    Ok(sums.broadcast_div(&counts.reshape(count_shape)?)?)
}

/// Per-bucket maximum of `values` rows (`[E, F] -> [size, F]`), detached from
/// the graph. Empty buckets hold zero.
pub fn scatter_max_detached(values: &Tensor, index: &Tensor, size: usize) -> Result<Tensor> {
    let (e, f) = values.dims2()?;
    let rows = values.detach().to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let index = index.to_vec1::<u32>()?;
    let mut max = vec![f32::NEG_INFINITY; size * f];
    for (row, &bucket) in rows.iter().zip(&index).take(e) {
        let slot = &mut max[bucket as usize * f..(bucket as usize + 1) * f];
        for (m, &v) in slot.iter_mut().zip(row) {
            *m = m.max(v);
        }
    }
    for m in max.iter_mut().filter(|m| !m.is_finite()) {
        *m = 0.0;
    }
    Ok(Tensor::from_vec(max, (size, f), values.device())?.to_dtype(values.dtype())?)
}

/// Softmax of `[E, F]` scores over the rows sharing a bucket. Each bucket is
/// shifted by its own maximum so a bucket whose scores sit far below another's
/// still normalises to one.
pub fn scatter_softmax(scores: &Tensor, index: &Tensor, size: usize) -> Result<Tensor> {
    let max = scatter_max_detached(scores, index, size)?.index_select(index, 0)?;
    let shifted = (scores - max)?.exp()?;
    let denom = scatter_sum(&shifted, index, size)?.index_select(index, 0)?;
    Ok(shifted.broadcast_div(&denom.clamp(f32::MIN_POSITIVE, f32::MAX)?)?)
}

/// Average node embeddings per graph: `[N, F] -> [B, F]`.
pub fn global_mean_pool(x: &Tensor, g: &GraphBatch) -> Result<Tensor> {
    scatter_mean(x, &g.batch, g.num_graphs)
}

/// Graph convolution (Kipf & Welling) with optional edge weights.
#[derive(Debug, Clone)]
pub struct GcnConv {
    lin: Linear,
    bias: Tensor,
}

impl GcnConv {
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let lin = linear_no_bias(in_dim, out_dim, vb.pp("lin"))?;
        let bias = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;
        Ok(Self { lin, bias })
    }

    /// `norm` is the output of [`gcn_norm`] for the same batch.
    pub fn forward(&self, x: &Tensor, norm: &(Tensor, Tensor, Tensor), num_nodes: usize) -> Result<Tensor> {
        let (src, dst, w) = norm;
        let h = self.lin.forward(x)?;
        let msg = h.index_select(src, 0)?.broadcast_mul(&w.unsqueeze(1)?)?;
        let out = scatter_sum(&msg, dst, num_nodes)?;
        Ok(out.broadcast_add(&self.bias)?)
    }
}

/// Three stacked GCN layers widening by `1x, 2x, 4x`, pooled per graph.
#[derive(Debug, Clone)]
pub struct GcnStack {
    convs: Vec<GcnConv>,
    dropout: Option<Dropout>,
    use_weights: bool,
}

impl GcnStack {
    pub fn new(in_dim: usize, emb: usize, dropout: f64, use_weights: bool, vb: VarBuilder) -> Result<Self> {
        let convs = vec![
            GcnConv::new(in_dim, emb, vb.pp("conv1"))?,
            GcnConv::new(emb, emb * 2, vb.pp("conv2"))?,
            GcnConv::new(emb * 2, emb * 4, vb.pp("conv3"))?,
        ];
        Ok(Self {
            convs,
            dropout: (dropout > 0.0).then(|| Dropout::new(dropout as f32)),
            use_weights,
        })
    }

    pub fn out_dim(&self, emb: usize) -> usize {
        emb * 4
    }

    /// Returns pooled graph embeddings `[B, 4 * emb]`.
    pub fn forward(&self, g: &GraphBatch, x: &Tensor, train: bool) -> Result<Tensor> {
        let norm = gcn_norm(g, self.use_weights)?;
        let mut h = x.clone();
        for conv in &self.convs {
            h = conv.forward(&h, &norm, g.num_nodes)?.relu()?;
            if let Some(d) = &self.dropout {
                h = d.forward(&h, train)?;
            }
        }
        global_mean_pool(&h, g)
    }
}

/// Fully connected layers with ReLU between them and dropout after the
/// first `dropout_layers` activations.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    dropout: Dropout,
    dropout_layers: usize,
    final_act: bool,
}

impl Mlp {
    pub fn new(
        dims: &[usize],
        dropout: f64,
        dropout_layers: usize,
        final_act: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(dims.len().saturating_sub(1));
        for (i, pair) in dims.windows(2).enumerate() {
            layers.push(linear(pair[0], pair[1], vb.pp(format!("fc{}", i + 1)))?);
        }
        Ok(Self {
            layers,
            dropout: Dropout::new(dropout as f32),
            dropout_layers,
            final_act,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let last = self.layers.len().saturating_sub(1);
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i < last || self.final_act {
                h = h.relu()?;
            }
            if i < self.dropout_layers {
                h = self.dropout.forward(&h, train)?;
            }
        }
        Ok(h)
    }
}

/// The concat-then-regress head shared by the two-branch models:
/// `2*out -> 1024 -> 512 -> 128 -> 1`, dropout on the first two hidden layers.
pub fn dense_out(output_dim: usize, dropout: f64, vb: VarBuilder) -> Result<Mlp> {
    Mlp::new(&[2 * output_dim, 1024, 512, 128, 1], dropout, 2, false, vb)
}

/// Concatenate ligand and protein embeddings along the feature axis.
pub fn concat_branches(lig: &Tensor, pro: &Tensor) -> Result<Tensor> {
    Ok(Tensor::cat(&[lig, pro], D::Minus1)?)
}
