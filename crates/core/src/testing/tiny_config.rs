use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::model::VarTransformer;
use crate::pipeline::TextToImagePipeline;
use crate::quantizer::ResidualQuantizer;
use crate::vae::VqVae;

use super::mocks::HashTextEncoder;

/// Create a tiny VAR config for testing (2 blocks, width 16, scales 1,2,3).
///
/// 14 tokens per image, 6x6 pixels. Uses well under 1MB of parameters.
pub fn tiny_model_config() -> ModelConfig {
    ModelConfig {
        depth: 2,
        embed_dim: 16,
        num_heads: 2,
        mlp_ratio: 2.0,
        attn_l2_norm: true,
        n_cond_embed: 8,
        patch_nums: vec![1, 2, 3],
        vocab_size: 32,
        z_channels: 4,
        ch: 32,
        ch_mult: vec![1, 1],
        num_res_blocks: 1,
        quant_resi: 0.5,
        share_quant_resi: 4,
        layer_norm_eps: 1e-6,
    }
}

/// A random-weight transformer and quantizer built from
/// [`tiny_model_config`]. The `VarMap` keeps the weights alive and lets
/// tests overwrite them.
pub struct TinyVar {
    pub varmap: VarMap,
    pub config: ModelConfig,
    pub model: VarTransformer,
    pub quantizer: ResidualQuantizer,
}

impl TinyVar {
    pub fn new(device: &Device) -> Self {
        Self::with_config(tiny_model_config(), device)
    }

    pub fn with_config(config: ModelConfig, device: &Device) -> Self {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = VarTransformer::new(&config, vb.pp("var")).expect("tiny transformer");
        let quantizer = ResidualQuantizer::new(
            config.vocab_size,
            config.z_channels,
            config.quant_resi,
            config.share_quant_resi,
            vb.pp("quantize"),
        )
        .expect("tiny quantizer");
        Self {
            varmap,
            config,
            model,
            quantizer,
        }
    }
}

/// A CPU pipeline of tiny random-weight parts with a hashing text encoder.
pub fn tiny_pipeline() -> (VarMap, TextToImagePipeline) {
    let device = Device::Cpu;
    let config = tiny_model_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = VarTransformer::new(&config, vb.pp("var")).expect("tiny transformer");
    let vae = VqVae::new(&config, vb.pp("vae")).expect("tiny vae");
    let encoder = HashTextEncoder::new(config.n_cond_embed, device.clone());
    let pipeline = TextToImagePipeline::new(Box::new(encoder), model, Box::new(vae), device)
        .expect("pipeline");
    (varmap, pipeline)
}
