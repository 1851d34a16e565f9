//! Shared fixtures for the integration tests: tiny random-weight parts built
//! through the public API only.

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use var_core::config::ModelConfig;
use var_core::model::VarTransformer;
use var_core::quantizer::ResidualQuantizer;
use var_core::GenerationConfig;

pub fn tiny_config() -> ModelConfig {
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

pub struct Parts {
    pub varmap: VarMap,
    pub config: ModelConfig,
    pub model: VarTransformer,
    pub quantizer: ResidualQuantizer,
}

pub fn tiny_parts() -> Parts {
    let device = Device::Cpu;
    let config = tiny_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = VarTransformer::new(&config, vb.pp("var")).unwrap();
    let quantizer = ResidualQuantizer::new(
        config.vocab_size,
        config.z_channels,
        config.quant_resi,
        config.share_quant_resi,
        vb.pp("quantize"),
    )
    .unwrap();
    Parts {
        varmap,
        config,
        model,
        quantizer,
    }
}

/// A deterministic `[batch, width]` embedding; `salt` separates prompts.
pub fn embedding(batch: usize, width: usize, salt: f32) -> Tensor {
    let values: Vec<f32> = (0..batch * width)
        .map(|i| ((i as f32 + salt) * 0.61).cos())
        .collect();
    Tensor::from_vec(values, (batch, width), &Device::Cpu).unwrap()
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// Guided, filtered sampling sized for the tiny vocabulary.
pub fn sampled_config(seed: u64) -> GenerationConfig {
    GenerationConfig {
        cfg_scale: 1.5,
        top_k: 16,
        top_p: 0.96,
        seed: Some(seed),
    }
}
