use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::conditioning::ConditioningMixer;
use crate::config::ModelConfig;
use crate::layers::{AdaLnBlock, AdaLnHead, GenerationCache};
use crate::schedule::ScaleSchedule;

/// The VAR transformer: conditioning, a stack of AdaLN blocks, and the
/// logits head over the quantizer's vocabulary.
///
/// Holds no per-call state. Attention caches are passed in explicitly, so a
/// single instance can serve any number of concurrent generation calls.
pub struct VarTransformer {
    word_embed: Linear,
    conditioning: ConditioningMixer,
    blocks: Vec<AdaLnBlock>,
    head_nm: AdaLnHead,
    head: Linear,
    schedule: ScaleSchedule,
    attn_bias: Tensor,
    config: ModelConfig,
}

impl VarTransformer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let schedule = ScaleSchedule::new(&config.patch_nums)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let embed_dim = config.embed_dim;

        let word_embed = linear(config.z_channels, embed_dim, vb.pp("word_embed"))?;
        let conditioning =
            ConditioningMixer::new(config.n_cond_embed, embed_dim, &schedule, vb.clone())?;

        let vb_blocks = vb.pp("blocks");
        let blocks = (0..config.depth)
            .map(|i| {
                AdaLnBlock::new(
                    embed_dim,
                    embed_dim,
                    config.num_heads,
                    config.mlp_hidden(),
                    config.attn_l2_norm,
                    config.layer_norm_eps,
                    vb_blocks.pp(i),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let head_nm =
            AdaLnHead::new(embed_dim, embed_dim, config.layer_norm_eps, vb.pp("head_nm"))?;
        let head = linear(embed_dim, config.vocab_size, vb.pp("head"))?;
        let attn_bias = schedule.attention_bias(vb.dtype(), vb.device())?;

        Ok(Self {
            word_embed,
            conditioning,
            blocks,
            head_nm,
            head,
            schedule,
            attn_bias,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn schedule(&self) -> &ScaleSchedule {
        &self.schedule
    }

    pub fn conditioning(&self) -> &ConditioningMixer {
        &self.conditioning
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    /// Parameter dtype.
    pub fn dtype(&self) -> DType {
        self.head.weight().dtype()
    }

    /// A fresh, empty cache sized for this model.
    pub fn new_cache(&self) -> GenerationCache {
        GenerationCache::new(self.blocks.len())
    }

    /// Run one scale's token map `[2B, pn², C]` through every block,
    /// appending its keys/values to `cache`, and return logits `[2B, pn², V]`.
    pub fn forward_step(
        &self,
        x: &Tensor,
        cond: &Tensor,
        cache: &mut GenerationCache,
    ) -> Result<Tensor> {
        if cache.depth() != self.blocks.len() {
            candle_core::bail!(
                "cache has {} layers, model has {}",
                cache.depth(),
                self.blocks.len()
            );
        }
        let mut x = x.clone();
        for (block, layer_cache) in self.blocks.iter().zip(cache.layers_mut()) {
            x = block.forward(&x, cond, None, Some(layer_cache))?;
        }
        self.logits(&x, cond)
    }

    /// Full-sequence forward `[2B, L, C]` without a cache, using the
    /// scale-causal attention bias. Equals the concatenation of
    /// [`forward_step`](Self::forward_step) outputs over all scales.
    pub fn forward_masked(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        let bias = self.attn_bias.to_dtype(x.dtype())?;
        for block in &self.blocks {
            x = block.forward(&x, cond, Some(&bias), None)?;
        }
        self.logits(&x, cond)
    }

    fn logits(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?;
        let cond = cond.to_dtype(DType::F32)?;
        let h = self.head_nm.forward(&x, &cond)?;
        // the head's weights may be stored in reduced precision
        let h = h.to_dtype(self.head.weight().dtype())?;
        self.head.forward(&h)?.to_dtype(DType::F32)
    }

    /// Next scale's latent map `[B, Cvae, pn, pn]` → token map `[B, pn², C]`
    /// including its position/level embedding.
    pub fn embed_scale_input(&self, next_map: &Tensor, si: usize) -> Result<Tensor> {
        let (b_sz, z_channels, _, _) = next_map.dims4()?;
        let tokens = next_map
            .reshape((b_sz, z_channels, ()))?
            .transpose(1, 2)?
            .contiguous()?;
        let tokens = tokens.to_dtype(self.word_embed.weight().dtype())?;
        self.word_embed
            .forward(&tokens)?
            .broadcast_add(&self.conditioning.scale_position(&self.schedule, si)?)
    }
}
