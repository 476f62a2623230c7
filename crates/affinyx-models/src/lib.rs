//! Affinyx Models
//!
//! Binding-affinity graph networks on Candle.
//!
//! Each architecture pairs a ligand graph branch with
//! a protein graph branch and regresses the concatenated embeddings to a
//! single affinity value.
//!
//! # Example
//! ```rust,no_run
//! use affinyx_common::RunConfig;
//! use affinyx_models::{AffinityModel, BindingModel, FeatureDims, GraphBatch};
//! use candle_core::{DType, Device};
//! use candle_nn::{VarBuilder, VarMap};
//!
//! fn predict(cfg: &RunConfig, dims: FeatureDims, pro: &GraphBatch, lig: &GraphBatch)
//!     -> affinyx_models::Result<Vec<f32>>
//! {
//!     let varmap = VarMap::new();
//!     let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//!     let model = AffinityModel::build(cfg, dims, vb)?;
//!     Ok(model.forward(pro, lig, false)?.flatten_all()?.to_vec1()?)
//! }
//! ```

pub mod architecture;
pub mod branches;
pub mod checkpoint;
pub mod chem;
pub mod embedder;
pub mod error;
pub mod gpt_neo;
pub mod graph;
pub mod gvp;
pub mod hub;
pub mod layers;
pub mod selfies;

pub use architecture::{AffinityModel, BindingModel, FeatureDims};
pub use checkpoint::{CheckpointMeta, StateDict, FORMAT_VERSION};
pub use chem::{LigandLmConfig, LigandLmEmbedder};
pub use embedder::{ProteinLmConfig, ProteinLmEmbedder};
pub use error::{ModelError, Result};
pub use graph::{Graph, GraphBatch, GraphDims, GraphTables};
pub use selfies::smiles_to_selfies;

#[cfg(test)]
pub(crate) mod test_graphs {
    use crate::graph::Graph;

    /// Bidirectional path `0 - 1 - ... - (n-1)`; node `i` has all features `i`.
    pub fn path_graph(n: usize, feat: usize) -> Graph {
        let mut edge_index = Vec::new();
        for i in 1..n as u32 {
            edge_index.push([i - 1, i]);
            edge_index.push([i, i - 1]);
        }
        Graph {
            x: (0..n).map(|i| vec![i as f32; feat]).collect(),
            edge_index,
            ..Default::default()
        }
    }

    /// Path graph with GVP inputs: `node_v` vectors per node, `edge_s`
    /// scalars and `edge_v` vectors per edge.
    pub fn vector_graph(n: usize, node_s: usize, node_v: usize, edge_s: usize, edge_v: usize) -> Graph {
        let mut g = path_graph(n, node_s);
        let e = g.num_edges();
        g.node_v = Some(
            (0..n)
                .map(|i| (0..node_v).map(|k| [i as f32, 1.0, k as f32]).collect())
                .collect(),
        );
        g.edge_attr = Some((0..e).map(|j| vec![(j % 3) as f32 * 0.5; edge_s]).collect());
        g.edge_v = Some((0..e).map(|j| vec![[0.0, (j % 2) as f32, 1.0]; edge_v]).collect());
        g
    }
}
