//! Per-residue protein embeddings from a BERT-family protein language model.
//!
//! The language model is frozen; its last hidden layer becomes the node
//! features of the protein graph (one row per residue).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use affinyx_common::HubConfig;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::bert::{BertModel, Config, HiddenAct, PositionEmbeddingType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::hub::{self, HubRepo};
use crate::{ModelError, Result};

/// Settings for [`ProteinLmEmbedder`].
#[derive(Debug, Clone)]
pub struct ProteinLmConfig {
    /// Hugging Face model ID.
    pub model_id: String,
    /// Longest accepted sequence in tokens, including the two special tokens.
    pub max_length: usize,
    pub batch_size: usize,
    pub use_gpu: bool,
    pub cache_dir: PathBuf,
    /// Only read files already present in `cache_dir`.
    pub offline: bool,
}

impl From<&HubConfig> for ProteinLmConfig {
    fn from(hub: &HubConfig) -> Self {
        Self {
            model_id: hub.protein_lm.clone(),
            max_length: 1024,
            batch_size: 8,
            use_gpu: hub.use_gpu,
            cache_dir: hub.resolved_cache_dir(),
            offline: hub.offline,
        }
    }
}

/// Insert spaces between residues and map rare amino acids to `X`, the form
/// BERT-style protein vocabularies expect.
pub fn prepare_sequence(seq: &str) -> String {
    seq.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c.to_ascii_uppercase() {
            'U' | 'Z' | 'O' | 'B' => 'X',
            other => other,
        })
        .map(String::from)
        .collect::<Vec<_>>()
        .join(" ")
}

enum Vocabulary {
    Tokenizer(Tokenizer),
    /// `vocab.txt` only: one token per residue plus `[CLS]`/`[SEP]`.
    Plain(HashMap<String, u32>),
}

impl Vocabulary {
    fn encode(&self, seq: &str) -> Result<Vec<u32>> {
        let spaced = prepare_sequence(seq);
        match self {
            Vocabulary::Tokenizer(t) => Ok(t.encode(spaced, true)?.get_ids().to_vec()),
            Vocabulary::Plain(vocab) => {
                let id = |tok: &str| {
                    vocab
                        .get(tok)
                        .or_else(|| vocab.get("[UNK]"))
                        .copied()
                        .ok_or_else(|| ModelError::Tokenizer(format!("token '{tok}' not in vocabulary")))
                };
                let mut ids = vec![id("[CLS]")?];
                for residue in spaced.split(' ').filter(|r| !r.is_empty()) {
                    ids.push(id(residue)?);
                }
                ids.push(id("[SEP]")?);
                Ok(ids)
            }
        }
    }
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: Option<PathBuf>,
    vocab: Option<PathBuf>,
    weights: PathBuf,
}

/// Frozen protein language model producing one embedding per residue.
pub struct ProteinLmEmbedder {
    model: BertModel,
    vocab: Vocabulary,
    device: Device,
    hidden_size: usize,
    max_length: usize,
    config: ProteinLmConfig,
}

impl ProteinLmEmbedder {
    pub async fn new(config: ProteinLmConfig) -> Result<Self> {
        let start = Instant::now();
        info!("Loading protein language model: {}", config.model_id);

        let device = hub::select_device(config.use_gpu)?;
        debug!("Using device: {:?}", device);

        let fetch_cfg = config.clone();
        let files = tokio::task::spawn_blocking(move || Self::fetch_files(&fetch_cfg))
            .await
            .map_err(|e| ModelError::Download(e.to_string()))??;

        let bert_config = Self::load_config(&files.config)?;
        let vocab = match (&files.tokenizer, &files.vocab) {
            (Some(path), _) => Vocabulary::Tokenizer(Tokenizer::from_file(path)?),
            (None, Some(path)) => Vocabulary::Plain(Self::read_vocab(path)?),
            (None, None) => {
                return Err(ModelError::ModelLoad(format!(
                    "{} has neither tokenizer.json nor vocab.txt",
                    config.model_id
                )))
            }
        };

        let vb = hub::load_weights(&files.weights, &device)?;
        let model = BertModel::load(vb, &bert_config)?;
        info!("Protein language model loaded in {:.2}s", start.elapsed().as_secs_f32());

        Ok(Self {
            model,
            vocab,
            device,
            hidden_size: bert_config.hidden_size,
            max_length: config.max_length.min(bert_config.max_position_embeddings),
            config,
        })
    }

    /// Resolve model files, from the local cache only when offline.
    fn fetch_files(config: &ProteinLmConfig) -> Result<ModelFiles> {
        let repo = HubRepo::open(&config.model_id, &config.cache_dir, config.offline)?;
        let config_path = repo.get("config.json")?;
        // Older BERT-style repositories ship vocab.txt only.
        let tokenizer = repo.try_get("tokenizer.json");
        let vocab = if tokenizer.is_none() { Some(repo.get("vocab.txt")?) } else { None };
        info!("Fetching model weights...");
        Ok(ModelFiles { config: config_path, tokenizer, vocab, weights: repo.weights()? })
    }

    fn read_vocab(path: &Path) -> Result<HashMap<String, u32>> {
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .lines()
            .enumerate()
            .map(|(i, line)| (line.trim().to_string(), i as u32))
            .collect())
    }

    fn load_config(path: &Path) -> Result<Config> {
        let json = hub::read_config(path)?;
        let int = |key: &str, default: u64| json.get(key).and_then(|v| v.as_u64()).unwrap_or(default) as usize;
        let float = |key: &str, default: f64| json.get(key).and_then(|v| v.as_f64()).unwrap_or(default);

        let hidden_act = match json.get("hidden_act").and_then(|v| v.as_str()) {
            Some("relu") => HiddenAct::Relu,
            Some("gelu_new") | Some("gelu_approximate") => HiddenAct::GeluApproximate,
            _ => HiddenAct::Gelu,
        };

        Ok(Config {
            vocab_size: int("vocab_size", 30),
            hidden_size: int("hidden_size", 1024),
            num_hidden_layers: int("num_hidden_layers", 30),
            num_attention_heads: int("num_attention_heads", 16),
            intermediate_size: int("intermediate_size", 4096),
            hidden_act,
            hidden_dropout_prob: float("hidden_dropout_prob", 0.0),
            max_position_embeddings: int("max_position_embeddings", 40000),
            type_vocab_size: int("type_vocab_size", 2),
            initializer_range: float("initializer_range", 0.02),
            layer_norm_eps: float("layer_norm_eps", 1e-12),
            pad_token_id: int("pad_token_id", 0),
            position_embedding_type: PositionEmbeddingType::Absolute,
            use_cache: true,
            classifier_dropout: None,
            model_type: None,
        })
    }

    /// Embed each sequence, returning `[len(seq), hidden]` rows per input
    /// with the special tokens stripped.
    pub fn embed_residues(&self, sequences: &[String]) -> Result<Vec<Vec<Vec<f32>>>> {
        let start = Instant::now();
        let mut out = Vec::with_capacity(sequences.len());
        for chunk in sequences.chunks(self.config.batch_size.max(1)) {
            out.extend(self.embed_batch(chunk)?);
        }
        debug!(
            "Embedded {} sequences in {:.2}s",
            sequences.len(),
            start.elapsed().as_secs_f32()
        );
        Ok(out)
    }

    fn embed_batch(&self, sequences: &[String]) -> Result<Vec<Vec<Vec<f32>>>> {
        let mut ids: Vec<Vec<u32>> = Vec::with_capacity(sequences.len());
        for seq in sequences {
            let encoded = self.vocab.encode(seq)?;
            if encoded.len() > self.max_length {
                return Err(ModelError::InvalidGraph(format!(
                    "sequence of {} tokens exceeds the model limit of {}",
                    encoded.len(),
                    self.max_length
                )));
            }
            ids.push(encoded);
        }

        let max_len = ids.iter().map(Vec::len).max().unwrap_or(0);
        let lengths: Vec<usize> = ids.iter().map(Vec::len).collect();
        let mut mask = Vec::with_capacity(ids.len());
        for row in ids.iter_mut() {
            let pad = max_len - row.len();
            mask.push([vec![1u32; row.len()], vec![0u32; pad]].concat());
            row.extend(std::iter::repeat_n(0, pad));
        }

        let batch = sequences.len();
        let input_ids = Tensor::from_vec(ids.concat(), (batch, max_len), &self.device)?;
        let attention_mask = Tensor::from_vec(mask.concat(), (batch, max_len), &self.device)?.to_dtype(DType::F32)?;
        let token_type_ids = input_ids.zeros_like()?;

        let hidden = self.model.forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        let mut out = Vec::with_capacity(batch);
        for (i, len) in lengths.into_iter().enumerate() {
            // drop [CLS] and [SEP]
            let residues = hidden.get(i)?.narrow(0, 1, len.saturating_sub(2))?;
            out.push(residues.to_dtype(DType::F32)?.to_vec2::<f32>()?);
        }
        Ok(out)
    }

    /// Width of each residue embedding.
    pub fn dimension(&self) -> usize {
        self.hidden_size
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_id
    }
}
