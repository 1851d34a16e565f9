use candle_core::{Module, Result, Tensor, D};
use candle_nn::{init, linear, Init, Linear, VarBuilder};

use super::kv_cache::KvCache;

/// Upper bound of the learned per-head log-scale.
const MAX_LOG_SCALE: f64 = 4.605_170_185_988_092; // ln(100)

/// Multi-head self-attention over token maps.
///
/// With `l2_norm` queries and keys are unit-normalised and the query is
/// multiplied by a learned per-head scale `exp(min(s, ln 100))`; the score
/// is then used unscaled. Without it the score is scaled by
/// `0.25 / sqrt(head_dim)`.
pub struct SelfAttention {
    mat_qkv: Linear,
    proj: Linear,
    /// `[1, heads, 1, 1]`, already clamped and exponentiated.
    scale_mul: Option<Tensor>,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    pub fn new(embed_dim: usize, num_heads: usize, l2_norm: bool, vb: VarBuilder) -> Result<Self> {
        let head_dim = embed_dim / num_heads;

        // the projection carries no bias of its own; q and v biases are
        // separate parameters and the key bias is fixed at zero
        let weight = vb.pp("mat_qkv").get_with_hints(
            (3 * embed_dim, embed_dim),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let q_bias = vb.get_with_hints(embed_dim, "q_bias", Init::Const(0.0))?;
        let v_bias = vb.get_with_hints(embed_dim, "v_bias", Init::Const(0.0))?;
        let k_bias = q_bias.zeros_like()?;
        let bias = Tensor::cat(&[&q_bias, &k_bias, &v_bias], 0)?;
        let mat_qkv = Linear::new(weight, Some(bias));

        let proj = linear(embed_dim, embed_dim, vb.pp("proj"))?;

        let (scale_mul, scale) = if l2_norm {
            let raw = vb.get_with_hints(
                (1, num_heads, 1, 1),
                "scale_mul",
                Init::Const(4f64.ln()),
            )?;
            (Some(raw.minimum(MAX_LOG_SCALE)?.exp()?), 1.0)
        } else {
            (None, 0.25 / (head_dim as f64).sqrt())
        };

        Ok(Self {
            mat_qkv,
            proj,
            scale_mul,
            num_heads,
            head_dim,
            scale,
        })
    }

    /// `x`: `[B, L, C]`. `attn_bias` is added to the `[B, H, L, L_kv]` scores.
    /// When `cache` is given the new keys/values are appended to it first and
    /// the queries attend over the whole cached history.
    pub fn forward(
        &self,
        x: &Tensor,
        attn_bias: Option<&Tensor>,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let (b_sz, seq_len, embed_dim) = x.dims3()?;

        let qkv = self
            .mat_qkv
            .forward(x)?
            .reshape((b_sz, seq_len, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let (q, k) = match &self.scale_mul {
            Some(scale_mul) => (
                l2_normalize(&q)?.broadcast_mul(scale_mul)?,
                l2_normalize(&k)?,
            ),
            None => (q, k),
        };

        let (k, v) = match cache {
            Some(cache) => cache.append(&k, &v)?,
            None => (k, v),
        };

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let scores = match attn_bias {
            Some(bias) => scores.broadcast_add(bias)?,
            None => scores,
        };
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;

        weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, embed_dim))?
            .apply(&self.proj)
    }
}

/// Normalise the last dimension to unit length (`eps = 1e-12`).
fn l2_normalize(xs: &Tensor) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    xs.broadcast_div(&norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScaleSchedule;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
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

    #[test]
    fn output_shape_matches_input() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = SelfAttention::new(16, 4, true, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &device).unwrap();
        let out = attn.forward(&x, None, None).unwrap();
        assert_eq!(out.dims(), &[2, 5, 16]);
    }

    #[test]
    fn l2_normalize_gives_unit_rows() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 3.0, (3, 8), &device).unwrap();
        let norms: Vec<f32> = l2_normalize(&x)
            .unwrap()
            .sqr()
            .unwrap()
            .sum(1)
            .unwrap()
            .to_vec1()
            .unwrap();
        for n in norms {
            assert!((n - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn log_scale_is_clamped() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints((1, 2, 1, 1), "scale_mul", Init::Const(10.0))
            .unwrap();
        let attn = SelfAttention::new(8, 2, true, vb).unwrap();

        let scale: Vec<f32> = attn
            .scale_mul
            .as_ref()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for s in scale {
            assert!((s - 100.0).abs() < 1e-3, "scale {s} should clamp to 100");
        }
    }

    #[test]
    fn unnormalised_mode_uses_reduced_scale() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = SelfAttention::new(64, 4, false, vb).unwrap();
        assert!(attn.scale_mul.is_none());
        assert!((attn.scale - 0.25 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn cached_scales_match_masked_sequence() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = SelfAttention::new(16, 2, true, vb).unwrap();

        let schedule = ScaleSchedule::new(&[1, 2, 3]).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, schedule.total_len(), 16), &device).unwrap();
        let bias = schedule.attention_bias(DType::F32, &device).unwrap();
        let masked = attn.forward(&x, Some(&bias), None).unwrap();

        let mut cache = KvCache::new();
        let mut pieces = Vec::new();
        for si in 0..schedule.num_scales() {
            let chunk = x
                .narrow(1, schedule.offset(si), schedule.scale_len(si))
                .unwrap();
            pieces.push(attn.forward(&chunk, None, Some(&mut cache)).unwrap());
        }
        let cached = Tensor::cat(&pieces, 1).unwrap();

        assert_eq!(cache.seq_len(), schedule.total_len());
        assert!(max_abs_diff(&masked, &cached) < 1e-4);
    }
}
