//! Prompt encoder.
//!
//! An OpenCLIP-style text transformer: token + positional embedding,
//! pre-LN causal blocks, final LN, pooling at the end-of-text token (the
//! highest id in the row), a linear projection and L2 normalisation.

use std::path::Path;

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::generation::GenerationError;

/// Maps prompts to conditioning vectors.
pub trait TextEncoder: Send + Sync {
    /// Width of each output vector.
    fn embed_dim(&self) -> usize;

    /// `prompts` → `[B, embed_dim]` F32, one unit-norm row per prompt.
    fn encode(&self, prompts: &[String]) -> std::result::Result<Tensor, GenerationError>;
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClipTextConfig {
    pub vocab_size: usize,
    pub width: usize,
    pub heads: usize,
    pub layers: usize,
    pub context_length: usize,
    /// Width after `text_projection`.
    pub embed_dim: usize,
    pub layer_norm_eps: f64,
    pub pad_token_id: u32,
    pub eot_token_id: u32,
}

impl Default for ClipTextConfig {
    /// ViT-L-14 text tower.
    fn default() -> Self {
        Self {
            vocab_size: 49408,
            width: 768,
            heads: 12,
            layers: 12,
            context_length: 77,
            embed_dim: 768,
            layer_norm_eps: 1e-5,
            pad_token_id: 0,
            eot_token_id: 49407,
        }
    }
}

/// Fit token ids to the context window: truncate keeping the end-of-text
/// token last, then pad.
pub fn fit_context(ids: &[u32], context_length: usize, eot_id: u32, pad_id: u32) -> Vec<u32> {
    let mut out: Vec<u32> = ids.iter().copied().take(context_length).collect();
    if ids.len() > context_length {
        if let Some(last) = out.last_mut() {
            *last = eot_id;
        }
    }
    out.resize(context_length, pad_id);
    out
}

struct ResidualAttention {
    in_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl ResidualAttention {
    fn new(width: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((3 * width, width), "in_proj_weight")?;
        let bias = vb.get(3 * width, "in_proj_bias")?;
        Ok(Self {
            in_proj: Linear::new(weight, Some(bias)),
            out_proj: linear(width, width, vb.pp("out_proj"))?,
            num_heads,
            head_dim: width / num_heads,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, width) = x.dims3()?;
        let qkv = self
            .in_proj
            .forward(x)?
            .reshape((b_sz, seq_len, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, width))?
            .apply(&self.out_proj)
    }
}

struct ResidualBlock {
    ln_1: LayerNorm,
    attn: ResidualAttention,
    ln_2: LayerNorm,
    c_fc: Linear,
    c_proj: Linear,
}

impl ResidualBlock {
    fn new(cfg: &ClipTextConfig, vb: VarBuilder) -> Result<Self> {
        let mlp_width = 4 * cfg.width;
        Ok(Self {
            ln_1: layer_norm(cfg.width, cfg.layer_norm_eps, vb.pp("ln_1"))?,
            attn: ResidualAttention::new(cfg.width, cfg.heads, vb.pp("attn"))?,
            ln_2: layer_norm(cfg.width, cfg.layer_norm_eps, vb.pp("ln_2"))?,
            c_fc: linear(cfg.width, mlp_width, vb.pp("mlp").pp("c_fc"))?,
            c_proj: linear(mlp_width, cfg.width, vb.pp("mlp").pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, mask)?)?;
        let h = self
            .ln_2
            .forward(&x)?
            .apply(&self.c_fc)?
            .gelu_erf()?
            .apply(&self.c_proj)?;
        x + h
    }
}

pub struct ClipTextTransformer {
    token_embedding: Embedding,
    positional_embedding: Tensor,
    blocks: Vec<ResidualBlock>,
    ln_final: LayerNorm,
    text_projection: Tensor,
    config: ClipTextConfig,
}

impl ClipTextTransformer {
    pub fn new(config: &ClipTextConfig, vb: VarBuilder) -> Result<Self> {
        let token_embedding = embedding(config.vocab_size, config.width, vb.pp("token_embedding"))?;
        let positional_embedding =
            vb.get((config.context_length, config.width), "positional_embedding")?;
        let vb_blocks = vb.pp("transformer").pp("resblocks");
        let blocks = (0..config.layers)
            .map(|i| ResidualBlock::new(config, vb_blocks.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let ln_final = layer_norm(config.width, config.layer_norm_eps, vb.pp("ln_final"))?;
        let text_projection = vb.get((config.width, config.embed_dim), "text_projection")?;
        Ok(Self {
            token_embedding,
            positional_embedding,
            blocks,
            ln_final,
            text_projection,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ClipTextConfig {
        &self.config
    }

    /// Token ids `[B, T]` → pooled, projected features `[B, embed_dim]`.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len) = ids.dims2()?;
        let pos = self.positional_embedding.narrow(0, 0, seq_len)?;
        let mut x = self.token_embedding.forward(ids)?.broadcast_add(&pos)?;

        let mask = causal_mask(seq_len, x.dtype(), x.device())?;
        for block in &self.blocks {
            x = block.forward(&x, &mask)?;
        }
        let x = self.ln_final.forward(&x)?;

        // the end-of-text token has the highest id in every row
        let eot = ids
            .argmax(D::Minus1)?
            .reshape((b_sz, 1, 1))?
            .broadcast_as((b_sz, 1, self.config.width))?
            .contiguous()?;
        x.gather(&eot, 1)?
            .squeeze(1)?
            .matmul(&self.text_projection)
    }
}

fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)?.to_dtype(dtype)
}

/// CLIP text tower with its BPE tokenizer.
pub struct ClipTextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    device: Device,
}

impl ClipTextEncoder {
    pub fn new(tokenizer: Tokenizer, model: ClipTextTransformer, device: Device) -> Self {
        Self {
            tokenizer,
            model,
            device,
        }
    }

    pub fn from_files(
        tokenizer_path: &Path,
        config: &ClipTextConfig,
        vb: VarBuilder,
    ) -> anyhow::Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        let device = vb.device().clone();
        let model = ClipTextTransformer::new(config, vb)?;
        Ok(Self::new(tokenizer, model, device))
    }

    fn tokenize(&self, prompt: &str) -> std::result::Result<Vec<u32>, GenerationError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| GenerationError::TextEncoder(format!("encode: {e}")))?;
        let cfg = self.model.config();
        Ok(fit_context(
            encoding.get_ids(),
            cfg.context_length,
            cfg.eot_token_id,
            cfg.pad_token_id,
        ))
    }
}

impl TextEncoder for ClipTextEncoder {
    fn embed_dim(&self) -> usize {
        self.model.config().embed_dim
    }

    fn encode(&self, prompts: &[String]) -> std::result::Result<Tensor, GenerationError> {
        let context_length = self.model.config().context_length;
        let mut ids = Vec::with_capacity(prompts.len() * context_length);
        for prompt in prompts {
            ids.extend(self.tokenize(prompt)?);
        }
        let ids = Tensor::from_vec(ids, (prompts.len(), context_length), &self.device)?;
        let features = self.model.forward(&ids)?.to_dtype(DType::F32)?;
        Ok(l2_normalize(&features)?)
    }
}

pub(crate) fn l2_normalize(xs: &Tensor) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    xs.broadcast_div(&norm)
}
