use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

/// Two-layer feed-forward block with tanh-approximated GELU.
pub struct Ffn {
    fc1: Linear,
    fc2: Linear,
}

impl Ffn {
    pub fn new(embed_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(embed_dim, hidden_dim, vb.pp("fc1"))?;
        let fc2 = linear(hidden_dim, embed_dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for Ffn {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc1.forward(xs)?.gelu()?.apply(&self.fc2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn ffn_preserves_width() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ffn = Ffn::new(16, 64, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 7, 16), &device).unwrap();
        assert_eq!(ffn.forward(&x).unwrap().dims(), &[2, 7, 16]);
    }
}
