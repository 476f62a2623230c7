//! GPT-Neo decoder stack, used as a frozen encoder for chemical language
//! models. Only the forward pass to the last hidden state is implemented.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, linear_no_bias, Embedding, LayerNorm, Linear, VarBuilder};
use serde_json::Value;

use crate::{ModelError, Result};

/// Additive bias for masked attention scores.
const NEG: f32 = -1e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    Global,
    /// Causal attention limited to the last `window_size` positions.
    Local,
}

impl AttentionKind {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(Self::Global),
            "local" => Ok(Self::Local),
            other => Err(ModelError::ModelLoad(format!("unknown GPT-Neo attention type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GptNeoConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub window_size: usize,
    pub layer_norm_epsilon: f64,
    /// One entry per block.
    pub attention_layers: Vec<AttentionKind>,
}

impl GptNeoConfig {
    /// Read a Hugging Face `config.json`. Layer kinds come from
    /// `attention_layers`, or are expanded from `attention_types` such as
    /// `[[["global", "local"], 12]]`.
    pub fn from_json(json: &Value) -> Result<Self> {
        let int = |key: &str, default: u64| json.get(key).and_then(Value::as_u64).unwrap_or(default) as usize;
        let hidden_size = int("hidden_size", 768);

        let attention_layers = match json.get("attention_layers").and_then(Value::as_array) {
            Some(kinds) => kinds
                .iter()
                .map(|k| AttentionKind::parse(k.as_str().unwrap_or_default()))
                .collect::<Result<Vec<_>>>()?,
            None => expand_attention_types(json.get("attention_types"))?,
        };
        let num_layers = int("num_layers", attention_layers.len() as u64);
        if attention_layers.len() != num_layers {
            return Err(ModelError::ModelLoad(format!(
                "{} attention layer kinds for {num_layers} layers",
                attention_layers.len()
            )));
        }

        Ok(Self {
            vocab_size: int("vocab_size", 50257),
            hidden_size,
            num_heads: int("num_heads", 12),
            intermediate_size: json
                .get("intermediate_size")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(4 * hidden_size),
            max_position_embeddings: int("max_position_embeddings", 2048),
            window_size: int("window_size", 256),
            layer_norm_epsilon: json.get("layer_norm_epsilon").and_then(Value::as_f64).unwrap_or(1e-5),
            attention_layers,
        })
    }
}

fn expand_attention_types(types: Option<&Value>) -> Result<Vec<AttentionKind>> {
    let bad = || ModelError::ModelLoad("malformed GPT-Neo attention_types".into());
    let mut layers = Vec::new();
    for entry in types.and_then(Value::as_array).ok_or_else(bad)? {
        let pattern = entry.get(0).and_then(Value::as_array).ok_or_else(bad)?;
        let repeat = entry.get(1).and_then(Value::as_u64).ok_or_else(bad)?;
        let kinds = pattern
            .iter()
            .map(|k| k.as_str().ok_or_else(bad).and_then(AttentionKind::parse))
            .collect::<Result<Vec<_>>>()?;
        for _ in 0..repeat {
            layers.extend_from_slice(&kinds);
        }
    }
    Ok(layers)
}

/// `[t, t]` additive mask: 0 where query `i` may attend to key `j`.
pub fn attention_bias(kind: AttentionKind, t: usize, window: usize, device: &Device) -> Result<Tensor> {
    let mut bias = vec![NEG; t * t];
    for i in 0..t {
        for j in 0..=i {
            if kind == AttentionKind::Global || i - j < window {
                bias[i * t + j] = 0.0;
            }
        }
    }
    Ok(Tensor::from_vec(bias, (t, t), device)?)
}

#[derive(Debug, Clone)]
struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(cfg: &GptNeoConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        if h % cfg.num_heads != 0 {
            return Err(ModelError::ModelLoad(format!("hidden size {h} not divisible by {} heads", cfg.num_heads)));
        }
        Ok(Self {
            q_proj: linear_no_bias(h, h, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(h, h, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(h, h, vb.pp("v_proj"))?,
            out_proj: linear(h, h, vb.pp("out_proj"))?,
            num_heads: cfg.num_heads,
            head_dim: h / cfg.num_heads,
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        Ok(x.reshape((b, t, self.num_heads, self.head_dim))?.transpose(1, 2)?.contiguous()?)
    }

    /// `bias` is `[t, t]`, `padding` is `[b, 1, 1, t]`.
    fn forward(&self, x: &Tensor, bias: &Tensor, padding: &Tensor) -> Result<Tensor> {
        let (b, t, h) = x.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(x)?)?;
        let k = self.split_heads(&self.k_proj.forward(x)?)?;
        let v = self.split_heads(&self.v_proj.forward(x)?)?;

        // GPT-Neo leaves scores unscaled.
        let scores = q.matmul(&k.t()?.contiguous()?)?;
        let scores = scores.broadcast_add(bias)?.broadcast_add(padding)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = probs.matmul(&v)?.transpose(1, 2)?.reshape((b, t, h))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

#[derive(Debug, Clone)]
struct Block {
    ln_1: LayerNorm,
    attn: SelfAttention,
    ln_2: LayerNorm,
    c_fc: Linear,
    c_proj: Linear,
    kind: AttentionKind,
}

impl Block {
    fn new(cfg: &GptNeoConfig, kind: AttentionKind, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            ln_1: layer_norm(h, cfg.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: SelfAttention::new(cfg, vb.pp("attn").pp("attention"))?,
            ln_2: layer_norm(h, cfg.layer_norm_epsilon, vb.pp("ln_2"))?,
            c_fc: linear(h, cfg.intermediate_size, vb.pp("mlp").pp("c_fc"))?,
            c_proj: linear(cfg.intermediate_size, h, vb.pp("mlp").pp("c_proj"))?,
            kind,
        })
    }

    fn forward(&self, x: &Tensor, bias: &Tensor, padding: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, bias, padding)?)?;
        // gelu_new is the tanh approximation
        let mlp = self.c_proj.forward(&self.c_fc.forward(&self.ln_2.forward(&x)?)?.gelu()?)?;
        Ok((x + mlp)?)
    }
}

/// GPT-Neo without its language-model head.
#[derive(Debug, Clone)]
pub struct GptNeoModel {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    window_size: usize,
    max_positions: usize,
}

impl GptNeoModel {
    /// Load weights saved either bare or under a `transformer.` prefix.
    pub fn load(vb: VarBuilder, cfg: &GptNeoConfig) -> Result<Self> {
        let vb = if vb.contains_tensor("transformer.wte.weight") { vb.pp("transformer") } else { vb };
        let blocks = cfg
            .attention_layers
            .iter()
            .enumerate()
            .map(|(i, kind)| Block::new(cfg, *kind, vb.pp("h").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            wte: embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("wte"))?,
            wpe: embedding(cfg.max_position_embeddings, cfg.hidden_size, vb.pp("wpe"))?,
            blocks,
            ln_f: layer_norm(cfg.hidden_size, cfg.layer_norm_epsilon, vb.pp("ln_f"))?,
            window_size: cfg.window_size,
            max_positions: cfg.max_position_embeddings,
        })
    }

    /// Last hidden state `[b, t, hidden]` for right-padded `input_ids`.
    /// `attention_mask` is `[b, t]` with 1 for real tokens.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (b, t) = input_ids.dims2()?;
        if t > self.max_positions {
            return Err(ModelError::InvalidGraph(format!(
                "{t} tokens exceed the {} positions the model supports",
                self.max_positions
            )));
        }
        let device = input_ids.device();
        let positions = Tensor::arange(0u32, t as u32, device)?;

        // token type ids are all zero and share the token embedding table
        let type_ids = Tensor::zeros((b, t), DType::U32, device)?;
        let mut h = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?
            .add(&self.wte.forward(&type_ids)?)?;

        let padding = ((1.0 - attention_mask.to_dtype(DType::F32)?)? * NEG as f64)?.reshape((b, 1, 1, t))?;
        let global = attention_bias(AttentionKind::Global, t, self.window_size, device)?;
        let local = attention_bias(AttentionKind::Local, t, self.window_size, device)?;
        for block in &self.blocks {
            let bias = match block.kind {
                AttentionKind::Global => &global,
                AttentionKind::Local => &local,
            };
            h = block.forward(&h, bias, &padding)?;
        }
        Ok(self.ln_f.forward(&h)?)
    }
}

/// Mean of `hidden` `[b, t, d]` over the positions where `mask` `[b, t]` is 1.
pub fn masked_mean(hidden: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.to_dtype(hidden.dtype())?.unsqueeze(D::Minus1)?;
    let sums = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?.clamp(1f32, f32::MAX)?;
    Ok(sums.broadcast_div(&counts)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use serde_json::json;

    fn tiny_config() -> GptNeoConfig {
        GptNeoConfig::from_json(&json!({
            "vocab_size": 12,
            "hidden_size": 8,
            "num_heads": 2,
            "num_layers": 2,
            "intermediate_size": null,
            "max_position_embeddings": 16,
            "window_size": 2,
            "attention_types": [[["global", "local"], 1]]
        }))
        .unwrap()
    }

    #[test]
    fn test_config_expands_attention_types() {
        let cfg = GptNeoConfig::from_json(&json!({
            "hidden_size": 128,
            "num_heads": 16,
            "num_layers": 24,
            "attention_types": [[["global", "local"], 12]]
        }))
        .unwrap();
        assert_eq!(cfg.attention_layers.len(), 24);
        assert_eq!(cfg.attention_layers[0], AttentionKind::Global);
        assert_eq!(cfg.attention_layers[23], AttentionKind::Local);
        assert_eq!(cfg.intermediate_size, 512);

        let err = GptNeoConfig::from_json(&json!({"num_layers": 3, "attention_layers": ["global"]})).unwrap_err();
        assert!(matches!(err, ModelError::ModelLoad(_)));
    }

    #[test]
    fn test_local_attention_sees_only_the_window() {
        let bias = attention_bias(AttentionKind::Local, 4, 2, &Device::Cpu).unwrap().to_vec2::<f32>().unwrap();
        let visible: Vec<Vec<bool>> = bias.iter().map(|r| r.iter().map(|v| *v == 0.0).collect()).collect();
        assert_eq!(visible[3], vec![false, false, true, true]);
        assert_eq!(visible[0], vec![true, false, false, false]);

        let global = attention_bias(AttentionKind::Global, 4, 2, &Device::Cpu).unwrap().to_vec2::<f32>().unwrap();
        assert!(global[3].iter().all(|v| *v == 0.0));
        assert_eq!(global[0][1], NEG);
    }

    #[test]
    fn test_padding_does_not_change_pooled_embedding() {
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = GptNeoModel::load(vb, &cfg).unwrap();

        let alone = Tensor::new(&[[3u32, 5, 7]], &Device::Cpu).unwrap();
        let alone_mask = Tensor::new(&[[1u32, 1, 1]], &Device::Cpu).unwrap();
        let padded = Tensor::new(&[[3u32, 5, 7, 0, 0], [4, 4, 0, 0, 0]], &Device::Cpu).unwrap();
        let padded_mask = Tensor::new(&[[1u32, 1, 1, 0, 0], [1, 1, 0, 0, 0]], &Device::Cpu).unwrap();

        let h = model.forward(&padded, &padded_mask).unwrap();
        assert_eq!(h.dims(), &[2, 5, 8]);

        let a = masked_mean(&model.forward(&alone, &alone_mask).unwrap(), &alone_mask).unwrap();
        let b = masked_mean(&h, &padded_mask).unwrap();
        let a = a.to_vec2::<f32>().unwrap();
        let b = b.to_vec2::<f32>().unwrap();
        for (x, y) in a[0].iter().zip(&b[0]) {
            assert!((x - y).abs() < 1e-4, "{x} vs {y}");
        }
    }

    #[test]
    fn test_too_many_tokens_are_rejected() {
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = GptNeoModel::load(vb, &cfg).unwrap();
        let ids = Tensor::zeros((1, 17), DType::U32, &Device::Cpu).unwrap();
        assert!(model.forward(&ids, &ids.ones_like().unwrap()).is_err());
    }
}
