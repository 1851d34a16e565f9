use serde::Deserialize;

/// Hyperparameters of the VAR transformer and its VQVAE tokenizer.
///
/// Field names follow the checkpoint's `config.json`. Every field has a
/// default so a partial config only overrides what it mentions.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of transformer blocks.
    pub depth: usize,
    /// Hidden width of the transformer (also the conditioning width).
    pub embed_dim: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
    /// Use l2-normalised queries/keys with a learned per-head log-scale.
    pub attn_l2_norm: bool,
    /// Width of the external text embedding.
    pub n_cond_embed: usize,
    /// Tokens per side at each scale, coarse to fine.
    pub patch_nums: Vec<usize>,
    /// Codebook size of the quantizer.
    pub vocab_size: usize,
    /// Latent channels of the VQVAE.
    pub z_channels: usize,
    /// Base channel width of the VQVAE decoder.
    pub ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    /// Blend ratio of the residual refinement filters.
    pub quant_resi: f64,
    /// Number of refinement filters shared across scales.
    pub share_quant_resi: usize,
    pub layer_norm_eps: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            depth: 12,
            embed_dim: 768,
            num_heads: 12,
            mlp_ratio: 4.0,
            attn_l2_norm: true,
            n_cond_embed: 768,
            patch_nums: vec![1, 2, 3, 4, 5, 6, 8, 10, 13, 16],
            vocab_size: 4096,
            z_channels: 32,
            ch: 160,
            ch_mult: vec![1, 1, 2, 2, 4],
            num_res_blocks: 2,
            quant_resi: 0.5,
            share_quant_resi: 4,
            layer_norm_eps: 1e-6,
        }
    }
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    pub fn mlp_hidden(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    /// Side length of the generated image in pixels.
    pub fn image_size(&self) -> usize {
        let downsample = 1usize << self.ch_mult.len().saturating_sub(1);
        self.patch_nums.last().copied().unwrap_or(0) * downsample
    }
}
