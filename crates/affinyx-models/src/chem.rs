//! Graph-level ligand embeddings from a chemical language model.
//!
//! SMILES are translated to SELFIES, run through a frozen GPT-Neo model and
//! mean-pooled over real tokens, giving one vector per ligand.

use std::path::PathBuf;
use std::time::Instant;

use affinyx_common::HubConfig;
use candle_core::{DType, Device, Tensor};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::gpt_neo::{masked_mean, GptNeoConfig, GptNeoModel};
use crate::hub::{self, HubRepo};
use crate::selfies::smiles_to_selfies;
use crate::{ModelError, Result};

/// Settings for [`LigandLmEmbedder`].
#[derive(Debug, Clone)]
pub struct LigandLmConfig {
    pub model_id: String,
    pub batch_size: usize,
    pub use_gpu: bool,
    pub cache_dir: PathBuf,
    pub offline: bool,
}

impl From<&HubConfig> for LigandLmConfig {
    fn from(hub: &HubConfig) -> Self {
        Self {
            model_id: hub.ligand_lm.clone(),
            batch_size: 32,
            use_gpu: hub.use_gpu,
            cache_dir: hub.resolved_cache_dir(),
            offline: hub.offline,
        }
    }
}

/// Frozen chemical language model producing one embedding per ligand.
pub struct LigandLmEmbedder {
    model: GptNeoModel,
    tokenizer: Tokenizer,
    pad_id: u32,
    device: Device,
    hidden_size: usize,
    config: LigandLmConfig,
}

impl LigandLmEmbedder {
    pub async fn new(config: LigandLmConfig) -> Result<Self> {
        let start = Instant::now();
        info!("Loading ligand language model: {}", config.model_id);
        let device = hub::select_device(config.use_gpu)?;

        let fetch_cfg = config.clone();
        let (config_path, tokenizer_path, weights) = tokio::task::spawn_blocking(move || -> Result<_> {
            let repo = HubRepo::open(&fetch_cfg.model_id, &fetch_cfg.cache_dir, fetch_cfg.offline)?;
            Ok((repo.get("config.json")?, repo.get("tokenizer.json")?, repo.weights()?))
        })
        .await
        .map_err(|e| ModelError::Download(e.to_string()))??;

        let neo_config = GptNeoConfig::from_json(&hub::read_config(&config_path)?)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)?;
        // pads are masked out, so any id inside the vocabulary will do
        let pad_id = tokenizer.token_to_id("[PAD]").filter(|id| (*id as usize) < neo_config.vocab_size).unwrap_or(0);

        let vb = hub::load_weights(&weights, &device)?;
        let model = GptNeoModel::load(vb, &neo_config)?;
        info!("Ligand language model loaded in {:.2}s", start.elapsed().as_secs_f32());

        Ok(Self { model, tokenizer, pad_id, device, hidden_size: neo_config.hidden_size, config })
    }

    /// Embed each SMILES string as one `hidden`-wide vector.
    pub fn embed_ligands(&self, smiles: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let mut out = Vec::with_capacity(smiles.len());
        for chunk in smiles.chunks(self.config.batch_size.max(1)) {
            out.extend(self.embed_batch(chunk)?);
        }
        debug!("Embedded {} ligands in {:.2}s", smiles.len(), start.elapsed().as_secs_f32());
        Ok(out)
    }

    fn embed_batch(&self, smiles: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut ids = Vec::with_capacity(smiles.len());
        for s in smiles {
            let selfies = smiles_to_selfies(s)?;
            let encoded = self.tokenizer.encode(selfies, true)?.get_ids().to_vec();
            if encoded.is_empty() {
                return Err(ModelError::Tokenizer(format!("'{s}' produced no tokens")));
            }
            ids.push(encoded);
        }
        let (ids, mask, max_len) = pad_right(ids, self.pad_id);
        let batch = smiles.len();
        let input_ids = Tensor::from_vec(ids, (batch, max_len), &self.device)?;
        let attention_mask = Tensor::from_vec(mask, (batch, max_len), &self.device)?;

        let hidden = self.model.forward(&input_ids, &attention_mask)?;
        Ok(masked_mean(&hidden, &attention_mask)?.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }

    /// Width of each ligand embedding.
    pub fn dimension(&self) -> usize {
        self.hidden_size
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_id
    }
}

/// Right-pad token rows to a common length. Returns flat ids, a flat 0/1
/// mask and the padded length.
fn pad_right(rows: Vec<Vec<u32>>, pad_id: u32) -> (Vec<u32>, Vec<u32>, usize) {
    let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut ids = Vec::with_capacity(rows.len() * max_len);
    let mut mask = Vec::with_capacity(rows.len() * max_len);
    for row in rows {
        let pad = max_len - row.len();
        mask.extend(std::iter::repeat_n(1u32, row.len()).chain(std::iter::repeat_n(0, pad)));
        ids.extend(row);
        ids.extend(std::iter::repeat_n(pad_id, pad));
    }
    (ids, mask, max_len)
}
