//! VQVAE latent decoder.
//!
//! Only the decoding half is implemented: `f_hat -> post_quant_conv ->
//! decoder -> clamp(-1, 1)`. The quantizer lives here too because the
//! checkpoint stores it under the VQVAE.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{conv2d, group_norm, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use crate::config::ModelConfig;
use crate::quantizer::ResidualQuantizer;

const NUM_GROUPS: usize = 32;
const GROUP_NORM_EPS: f64 = 1e-6;

/// Turns a latent accumulator into pixels.
pub trait LatentDecoder: Send + Sync {
    /// Codebook and refinement filters the accumulator is built with.
    fn quantizer(&self) -> &ResidualQuantizer;

    /// `[B, Cvae, h, w]` → `[B, 3, H, W]` in `[-1, 1]`.
    fn fhat_to_img(&self, f_hat: &Tensor) -> Result<Tensor>;
}

fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_c, out_c, 3, cfg, vb)
}

fn conv1x1(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(in_c, out_c, 1, Conv2dConfig::default(), vb)
}

fn normalize(channels: usize, vb: VarBuilder) -> Result<GroupNorm> {
    group_norm(NUM_GROUPS, channels, GROUP_NORM_EPS, vb)
}

struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        let nin_shortcut = if in_c != out_c {
            Some(conv1x1(in_c, out_c, vb.pp("nin_shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            norm1: normalize(in_c, vb.pp("norm1"))?,
            conv1: conv3x3(in_c, out_c, vb.pp("conv1"))?,
            norm2: normalize(out_c, vb.pp("norm2"))?,
            conv2: conv3x3(out_c, out_c, vb.pp("conv2"))?,
            nin_shortcut,
        })
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.norm1.forward(xs)?.silu()?.apply(&self.conv1)?;
        let h = self.norm2.forward(&h)?.silu()?.apply(&self.conv2)?;
        let shortcut = match &self.nin_shortcut {
            Some(conv) => conv.forward(xs)?,
            None => xs.clone(),
        };
        shortcut + h
    }
}

/// Single-head spatial self-attention with a fused `1x1` qkv projection.
struct AttnBlock {
    norm: GroupNorm,
    qkv: Conv2d,
    proj_out: Conv2d,
    channels: usize,
}

impl AttnBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: normalize(channels, vb.pp("norm"))?,
            qkv: conv1x1(channels, 3 * channels, vb.pp("qkv"))?,
            proj_out: conv1x1(channels, channels, vb.pp("proj_out"))?,
            channels,
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_sz, _, h, w) = xs.dims4()?;
        let c = self.channels;
        let qkv = self
            .norm
            .forward(xs)?
            .apply(&self.qkv)?
            .reshape((b_sz, 3, c, h * w))?;
        let q = qkv.narrow(1, 0, 1)?.squeeze(1)?.transpose(1, 2)?.contiguous()?;
        let k = qkv.narrow(1, 1, 1)?.squeeze(1)?.contiguous()?;
        let v = qkv.narrow(1, 2, 1)?.squeeze(1)?.contiguous()?;

        let weights = (q.matmul(&k)? * (c as f64).powf(-0.5))?;
        let weights = candle_nn::ops::softmax(&weights, D::Minus1)?;
        let out = v
            .matmul(&weights.transpose(1, 2)?.contiguous()?)?
            .reshape((b_sz, c, h, w))?
            .apply(&self.proj_out)?;
        xs + out
    }
}

/// One decoder resolution level: res-blocks (each optionally followed by
/// attention) and an optional nearest-2x upsample + conv.
struct UpLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    upsample: Option<Conv2d>,
}

impl Module for UpLevel {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for (i, block) in self.blocks.iter().enumerate() {
            h = block.forward(&h)?;
            if let Some(attn) = self.attns.get(i) {
                h = attn.forward(&h)?;
            }
        }
        if let Some(conv) = &self.upsample {
            let (_, _, height, width) = h.dims4()?;
            h = h.upsample_nearest2d(height * 2, width * 2)?.apply(conv)?;
        }
        Ok(h)
    }
}

pub struct Decoder {
    conv_in: Conv2d,
    mid_block_1: ResnetBlock,
    mid_attn_1: AttnBlock,
    mid_block_2: ResnetBlock,
    /// Indexed by resolution level; run from the last (coarsest) to 0.
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    pub fn new(
        ch: usize,
        ch_mult: &[usize],
        num_res_blocks: usize,
        z_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_levels = ch_mult.len();
        if num_levels == 0 {
            candle_core::bail!("decoder needs at least one resolution level");
        }
        let mut block_in = ch * ch_mult[num_levels - 1];

        let conv_in = conv3x3(z_channels, block_in, vb.pp("conv_in"))?;
        let vb_mid = vb.pp("mid");
        let mid_block_1 = ResnetBlock::new(block_in, block_in, vb_mid.pp("block_1"))?;
        let mid_attn_1 = AttnBlock::new(block_in, vb_mid.pp("attn_1"))?;
        let mid_block_2 = ResnetBlock::new(block_in, block_in, vb_mid.pp("block_2"))?;

        let vb_up = vb.pp("up");
        let mut up: Vec<Option<UpLevel>> = (0..num_levels).map(|_| None).collect();
        for level in (0..num_levels).rev() {
            let vb_level = vb_up.pp(level);
            let block_out = ch * ch_mult[level];
            let mut blocks = Vec::with_capacity(num_res_blocks + 1);
            let mut attns = Vec::new();
            for i in 0..=num_res_blocks {
                blocks.push(ResnetBlock::new(block_in, block_out, vb_level.pp("block").pp(i))?);
                block_in = block_out;
                if level == num_levels - 1 {
                    attns.push(AttnBlock::new(block_in, vb_level.pp("attn").pp(i))?);
                }
            }
            let upsample = if level != 0 {
                Some(conv3x3(block_in, block_in, vb_level.pp("upsample").pp("conv"))?)
            } else {
                None
            };
            up[level] = Some(UpLevel {
                blocks,
                attns,
                upsample,
            });
        }
        let up = up.into_iter().flatten().collect();

        Ok(Self {
            conv_in,
            mid_block_1,
            mid_attn_1,
            mid_block_2,
            up,
            norm_out: normalize(block_in, vb.pp("norm_out"))?,
            conv_out: conv3x3(block_in, 3, vb.pp("conv_out"))?,
        })
    }
}

impl Module for Decoder {
    fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let mut h = self
            .conv_in
            .forward(z)?
            .apply(&self.mid_block_1)?
            .apply(&self.mid_attn_1)?
            .apply(&self.mid_block_2)?;
        for level in self.up.iter().rev() {
            h = level.forward(&h)?;
        }
        self.norm_out.forward(&h)?.silu()?.apply(&self.conv_out)
    }
}

/// Multi-scale VQVAE: the quantizer used during generation plus the
/// convolutional decoder used once at the end.
pub struct VqVae {
    quantize: ResidualQuantizer,
    post_quant_conv: Conv2d,
    decoder: Decoder,
}

impl VqVae {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let quantize = ResidualQuantizer::new(
            config.vocab_size,
            config.z_channels,
            config.quant_resi,
            config.share_quant_resi,
            vb.pp("quantize"),
        )?;
        let post_quant_conv =
            conv3x3(config.z_channels, config.z_channels, vb.pp("post_quant_conv"))?;
        let decoder = Decoder::new(
            config.ch,
            &config.ch_mult,
            config.num_res_blocks,
            config.z_channels,
            vb.pp("decoder"),
        )?;
        Ok(Self {
            quantize,
            post_quant_conv,
            decoder,
        })
    }
}

impl LatentDecoder for VqVae {
    fn quantizer(&self) -> &ResidualQuantizer {
        &self.quantize
    }

    fn fhat_to_img(&self, f_hat: &Tensor) -> Result<Tensor> {
        self.post_quant_conv
            .forward(f_hat)?
            .apply(&self.decoder)?
            .clamp(-1f32, 1f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_model_config;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn resnet_block_changes_width_through_shortcut() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = ResnetBlock::new(32, 64, vb).unwrap();
        assert!(block.nin_shortcut.is_some());

        let x = Tensor::randn(0f32, 1.0, (1, 32, 4, 4), &device).unwrap();
        assert_eq!(block.forward(&x).unwrap().dims(), &[1, 64, 4, 4]);
    }

    #[test]
    fn attn_block_preserves_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = AttnBlock::new(32, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 32, 3, 5), &device).unwrap();
        assert_eq!(attn.forward(&x).unwrap().dims(), &[2, 32, 3, 5]);
    }

    #[test]
    fn decoder_builds_one_level_per_multiplier() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = Decoder::new(32, &[1, 2], 1, 4, vb).unwrap();

        assert_eq!(decoder.up.len(), 2);
        assert!(decoder.up[0].upsample.is_none());
        assert!(decoder.up[1].upsample.is_some());
        // attention only at the coarsest level
        assert!(decoder.up[0].attns.is_empty());
        assert_eq!(decoder.up[1].attns.len(), 2);
        assert_eq!(decoder.up[1].blocks.len(), 2);
    }

    #[test]
    fn fhat_to_img_upsamples_and_clamps() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_model_config();
        let vae = VqVae::new(&config, vb).unwrap();

        let pn = *config.patch_nums.last().unwrap();
        let f_hat = Tensor::randn(0f32, 4.0, (2, config.z_channels, pn, pn), &device).unwrap();
        let img = vae.fhat_to_img(&f_hat).unwrap();
        let side = config.image_size();
        assert_eq!(img.dims(), &[2, 3, side, side]);

        let values: Vec<f32> = img.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
