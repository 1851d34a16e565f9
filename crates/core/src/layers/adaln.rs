use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use super::attention::SelfAttention;
use super::kv_cache::KvCache;
use super::mlp::Ffn;
use super::normalization::{modulate, LayerNormNoAffine};

/// Project `cond` `[B, D]` through `silu -> linear` and split the result
/// into `n` chunks of `[B, 1, C]`.
fn ada_params(ada_lin: &Linear, cond: &Tensor, n: usize, embed_dim: usize) -> Result<Vec<Tensor>> {
    let b_sz = cond.dim(0)?;
    let params = cond
        .silu()?
        .apply(ada_lin)?
        .reshape((b_sz, 1, n, embed_dim))?;
    (0..n)
        .map(|i| params.narrow(2, i, 1)?.squeeze(2))
        .collect()
}

/// Transformer block with conditioning-driven LayerNorm modulation.
///
/// `ada_lin` yields six per-channel vectors in the order
/// `gamma1, gamma2, scale1, scale2, shift1, shift2`:
///
/// ```text
/// x = x + attn(ln(x) * (1 + scale1) + shift1) * gamma1
/// x = x + ffn (ln(x) * (1 + scale2) + shift2) * gamma2
/// ```
pub struct AdaLnBlock {
    attn: SelfAttention,
    ffn: Ffn,
    ada_lin: Linear,
    norm: LayerNormNoAffine,
    embed_dim: usize,
}

impl AdaLnBlock {
    pub fn new(
        embed_dim: usize,
        cond_dim: usize,
        num_heads: usize,
        mlp_hidden: usize,
        attn_l2_norm: bool,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let attn = SelfAttention::new(embed_dim, num_heads, attn_l2_norm, vb.pp("attn"))?;
        let ffn = Ffn::new(embed_dim, mlp_hidden, vb.pp("ffn"))?;
        // index 0 of the checkpoint's sequential is the activation
        let ada_lin = linear(cond_dim, 6 * embed_dim, vb.pp("ada_lin").pp("1"))?;
        Ok(Self {
            attn,
            ffn,
            ada_lin,
            norm: LayerNormNoAffine::new(eps),
            embed_dim,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        cond: &Tensor,
        attn_bias: Option<&Tensor>,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let p = ada_params(&self.ada_lin, cond, 6, self.embed_dim)?;
        let (gamma1, gamma2, scale1, scale2, shift1, shift2) =
            (&p[0], &p[1], &p[2], &p[3], &p[4], &p[5]);

        let h = modulate(&self.norm.forward(x)?, scale1, shift1)?;
        let h = self.attn.forward(&h, attn_bias, cache)?;
        let x = (x + h.broadcast_mul(gamma1)?)?;

        let h = modulate(&self.norm.forward(&x)?, scale2, shift2)?;
        let h = self.ffn.forward(&h)?;
        x + h.broadcast_mul(gamma2)?
    }
}

/// Final conditioning-modulated LayerNorm applied before the logits head.
pub struct AdaLnHead {
    ada_lin: Linear,
    norm: LayerNormNoAffine,
    embed_dim: usize,
}

impl AdaLnHead {
    pub fn new(embed_dim: usize, cond_dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let ada_lin = linear(cond_dim, 2 * embed_dim, vb.pp("ada_lin").pp("1"))?;
        Ok(Self {
            ada_lin,
            norm: LayerNormNoAffine::new(eps),
            embed_dim,
        })
    }

    pub fn forward(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let p = ada_params(&self.ada_lin, cond, 2, self.embed_dim)?;
        modulate(&self.norm.forward(x)?, &p[0], &p[1])
    }
}
