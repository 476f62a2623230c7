//! Protein and ligand graphs, and their collation into batched tensors.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{ModelError, Result};

/// One molecular graph as stored on disk.
///
/// `edge_index` holds directed `[source, target]` pairs. Vector features are
/// lists of 3D vectors per node/edge and are only present for GVP inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub x: Vec<Vec<f32>>,
    pub edge_index: Vec<[u32; 2]>,
    #[serde(default)]
    pub edge_weight: Option<Vec<f32>>,
    #[serde(default)]
    pub edge_attr: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    pub node_v: Option<Vec<Vec<[f32; 3]>>>,
    #[serde(default)]
    pub edge_v: Option<Vec<Vec<[f32; 3]>>>,
    /// Residue or SMILES sequence, when the graph was built from one.
    #[serde(default)]
    pub seq: Option<String>,
    /// Whole-graph embedding from a pretrained language model.
    #[serde(default)]
    pub lm_emb: Option<Vec<f32>>,
}

/// Feature widths of a graph family, used to size the input layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDims {
    pub node: usize,
    pub edge_attr: usize,
    pub node_v: usize,
    pub edge_v: usize,
    pub lm_emb: usize,
}

/// Which optional tables a graph carries. Graphs batched together must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphTables {
    pub edge_weight: bool,
    pub edge_attr: bool,
    pub node_v: bool,
    pub edge_v: bool,
    pub lm_emb: bool,
}

impl Graph {
    pub fn num_nodes(&self) -> usize {
        self.x.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_index.len()
    }

    pub fn dims(&self) -> GraphDims {
        GraphDims {
            node: self.x.first().map(Vec::len).unwrap_or(0),
            edge_attr: first_width(self.edge_attr.as_deref()),
            node_v: first_width(self.node_v.as_deref()),
            edge_v: first_width(self.edge_v.as_deref()),
            lm_emb: self.lm_emb.as_ref().map(Vec::len).unwrap_or(0),
        }
    }

    pub fn tables(&self) -> GraphTables {
        GraphTables {
            edge_weight: self.edge_weight.is_some(),
            edge_attr: self.edge_attr.is_some(),
            node_v: self.node_v.is_some(),
            edge_v: self.edge_v.is_some(),
            lm_emb: self.lm_emb.is_some(),
        }
    }

    /// Check internal consistency: edge endpoints in range, per-edge and
    /// per-node side tables of the right length, uniform feature widths.
    pub fn validate(&self) -> Result<()> {
        let n = self.num_nodes();
        let e = self.num_edges();
        let dims = self.dims();

        if self.x.iter().any(|row| row.len() != dims.node) {
            return Err(ModelError::InvalidGraph("ragged node features".into()));
        }
        if let Some(bad) = self.edge_index.iter().find(|[s, t]| *s as usize >= n || *t as usize >= n) {
            return Err(ModelError::InvalidGraph(format!(
                "edge {:?} out of range for {} nodes",
                bad, n
            )));
        }
        check_len("edge_weight", self.edge_weight.as_ref().map(Vec::len), e)?;
        check_len("edge_attr", self.edge_attr.as_ref().map(Vec::len), e)?;
        check_len("node_v", self.node_v.as_ref().map(Vec::len), n)?;
        check_len("edge_v", self.edge_v.as_ref().map(Vec::len), e)?;
        Ok(())
    }
}

fn first_width<T>(rows: Option<&[Vec<T>]>) -> usize {
    rows.and_then(|r| r.first()).map(Vec::len).unwrap_or(0)
}

fn check_len(name: &str, got: Option<usize>, want: usize) -> Result<()> {
    match got {
        Some(len) if len != want => Err(ModelError::InvalidGraph(format!(
            "{name} has {len} rows, expected {want}"
        ))),
        _ => Ok(()),
    }
}

/// A disjoint union of graphs laid out as flat tensors.
#[derive(Debug, Clone)]
pub struct GraphBatch {
    /// Node features `[N, F]`.
    pub x: Tensor,
    /// Edge sources `[E]` (u32).
    pub src: Tensor,
    /// Edge targets `[E]` (u32).
    pub dst: Tensor,
    pub edge_weight: Option<Tensor>,
    /// `[E, De]`
    pub edge_attr: Option<Tensor>,
    /// `[N, Vn, 3]`
    pub node_v: Option<Tensor>,
    /// `[E, Ve, 3]`
    pub edge_v: Option<Tensor>,
    /// `[B, D]`
    pub lm_emb: Option<Tensor>,
    /// Graph index of every node `[N]` (u32).
    pub batch: Tensor,
    pub num_nodes: usize,
    pub num_graphs: usize,
}

impl GraphBatch {
    /// Concatenate graphs, offsetting edge indices by the running node count.
    pub fn collate(graphs: &[&Graph], device: &Device) -> Result<Self> {
        if graphs.is_empty() {
            return Err(ModelError::InvalidGraph("cannot collate an empty batch".into()));
        }
        let dims = graphs[0].dims();

        let mut x = Vec::new();
        let mut src = Vec::new();
        let mut dst = Vec::new();
        let mut batch = Vec::new();
        let mut offset = 0u32;

        for (gi, g) in graphs.iter().enumerate() {
            if g.dims() != dims {
                return Err(ModelError::InvalidGraph(format!(
                    "graph {gi} has dims {:?}, batch has {:?}",
                    g.dims(),
                    dims
                )));
            }
            for row in &g.x {
                x.extend_from_slice(row);
            }
            for [s, t] in &g.edge_index {
                src.push(s + offset);
                dst.push(t + offset);
            }
            batch.extend(std::iter::repeat(gi as u32).take(g.num_nodes()));
            offset += g.num_nodes() as u32;
        }

        let num_nodes = offset as usize;
        let num_edges = src.len();

        let edge_weight = gather_optional(graphs, "edge_weight", |g| g.edge_weight.clone())?
            .map(|w| Tensor::from_vec(w, num_edges, device))
            .transpose()?;
        let edge_attr = gather_optional(graphs, "edge_attr", |g| {
            g.edge_attr.as_ref().map(|rows| rows.concat())
        })?
        .map(|v| Tensor::from_vec(v, (num_edges, dims.edge_attr), device))
        .transpose()?;
        let node_v = gather_optional(graphs, "node_v", |g| g.node_v.as_ref().map(|r| flatten_vectors(r)))?
            .map(|v| Tensor::from_vec(v, (num_nodes, dims.node_v, 3), device))
            .transpose()?;
        let edge_v = gather_optional(graphs, "edge_v", |g| g.edge_v.as_ref().map(|r| flatten_vectors(r)))?
            .map(|v| Tensor::from_vec(v, (num_edges, dims.edge_v, 3), device))
            .transpose()?;
        let lm_emb = gather_optional(graphs, "lm_emb", |g| g.lm_emb.clone())?
            .map(|v| Tensor::from_vec(v, (graphs.len(), dims.lm_emb), device))
            .transpose()?;

        Ok(Self {
            x: Tensor::from_vec(x, (num_nodes, dims.node), device)?,
            src: Tensor::from_vec(src, num_edges, device)?,
            dst: Tensor::from_vec(dst, num_edges, device)?,
            edge_weight,
            edge_attr,
            node_v,
            edge_v,
            lm_emb,
            batch: Tensor::from_vec(batch, num_nodes, device)?,
            num_nodes,
            num_graphs: graphs.len(),
        })
    }

    pub fn device(&self) -> &Device {
        self.x.device()
    }

    pub fn num_edges(&self) -> usize {
        self.src.dims1().unwrap_or(0)
    }

    /// Per-edge weights, or ones when the graph is unweighted.
    pub fn weights_or_ones(&self) -> Result<Tensor> {
        match &self.edge_weight {
            Some(w) => Ok(w.clone()),
            None => Ok(Tensor::ones(self.num_edges(), DType::F32, self.device())?),
        }
    }

    pub fn require_vectors(&self) -> Result<(&Tensor, &Tensor, &Tensor)> {
        match (&self.node_v, &self.edge_attr, &self.edge_v) {
            (Some(nv), Some(es), Some(ev)) => Ok((nv, es, ev)),
            _ => Err(ModelError::InvalidGraph(
                "GVP branch needs node_v, edge_attr and edge_v".into(),
            )),
        }
    }

    pub fn require_lm_emb(&self) -> Result<&Tensor> {
        self.lm_emb.as_ref().ok_or_else(|| {
            ModelError::InvalidGraph("language model embeddings are required; run `affinyx embed`".into())
        })
    }

    pub fn require_edge_attr(&self) -> Result<&Tensor> {
        self.edge_attr
            .as_ref()
            .ok_or_else(|| ModelError::InvalidGraph("edge attributes are required".into()))
    }
}

fn flatten_vectors(rows: &[Vec<[f32; 3]>]) -> Vec<f32> {
    rows.iter().flatten().flat_map(|v| v.iter().copied()).collect()
}

/// All-or-nothing gather of an optional per-graph table.
fn gather_optional<T>(
    graphs: &[&Graph],
    name: &str,
    get: impl Fn(&Graph) -> Option<Vec<T>>,
) -> Result<Option<Vec<T>>> {
    let parts: Vec<Option<Vec<T>>> = graphs.iter().map(|g| get(*g)).collect();
    let present = parts.iter().filter(|p| p.is_some()).count();
    if present == 0 {
        return Ok(None);
    }
    if present != parts.len() {
        return Err(ModelError::InvalidGraph(format!(
            "{name} present on {present} of {} graphs",
            parts.len()
        )));
    }
    Ok(Some(parts.into_iter().flatten().flatten().collect()))
}
