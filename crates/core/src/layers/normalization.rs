use candle_core::{DType, Module, Result, Tensor, D};

/// LayerNorm over the last dimension without learned affine parameters.
///
/// Gain and shift come from the conditioning instead (see [`modulate`]).
#[derive(Clone, Copy, Debug)]
pub struct LayerNormNoAffine {
    eps: f64,
}

impl LayerNormNoAffine {
    pub fn new(eps: f64) -> Self {
        Self { eps }
    }
}

impl Module for LayerNormNoAffine {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        centered
            .broadcast_div(&(var + self.eps)?.sqrt()?)?
            .to_dtype(dtype)
    }
}

/// Adaptive modulation `x * (1 + scale) + shift`, with `scale`/`shift`
/// broadcast over the sequence axis.
pub fn modulate(xs: &Tensor, scale: &Tensor, shift: &Tensor) -> Result<Tensor> {
    xs.broadcast_mul(&(scale + 1.0)?)?.broadcast_add(shift)
}
