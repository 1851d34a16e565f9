//! Residual quantization refiner.
//!
//! Owns the codebook and the pool of refinement filters. Each scale's sampled
//! codes are looked up, refined, and added into the full-resolution latent
//! accumulator `f_hat`.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Embedding, VarBuilder};
use tracing::debug;

use crate::layers::interpolate;
use crate::sampling::ConfigError;
use crate::schedule::ScaleSchedule;

/// `3x3` convolutional correction blended with the identity:
/// `(1 - ratio) * h + ratio * conv(h)`.
pub struct Phi {
    conv: Conv2d,
    resi_ratio: f64,
}

impl Phi {
    pub fn new(channels: usize, quant_resi: f64, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv2d(channels, channels, 3, cfg, vb)?;
        Ok(Self {
            conv,
            resi_ratio: quant_resi.abs(),
        })
    }
}

impl Module for Phi {
    fn forward(&self, h: &Tensor) -> Result<Tensor> {
        let blended = self.conv.forward(h)?.affine(self.resi_ratio, 0.0)?;
        h.affine(1.0 - self.resi_ratio, 0.0)? + blended
    }
}

/// Pool of `K` filters shared across scales by nearest tick.
///
/// Ticks are evenly spaced over `[1/(3K), 1 - 1/(3K)]` for `K = 4` and over
/// `[1/(2K), 1 - 1/(2K)]` otherwise.
pub struct PhiPool {
    filters: Vec<Phi>,
    ticks: Vec<f64>,
}

impl PhiPool {
    pub fn new(filters: Vec<Phi>) -> std::result::Result<Self, ConfigError> {
        if filters.is_empty() {
            return Err(ConfigError::EmptyFilterPool);
        }
        let ticks = filter_ticks(filters.len());
        Ok(Self { filters, ticks })
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn ticks(&self) -> &[f64] {
        &self.ticks
    }

    /// Filter for a scale at normalised position `at ∈ [0, 1]`.
    pub fn get(&self, at: f64) -> &Phi {
        &self.filters[nearest_tick(&self.ticks, at)]
    }
}

fn filter_ticks(k: usize) -> Vec<f64> {
    let margin = if k == 4 {
        1.0 / 3.0 / k as f64
    } else {
        1.0 / 2.0 / k as f64
    };
    linspace(margin, 1.0 - margin, k)
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

/// Index of the closest tick; ties go to the lower index.
pub fn nearest_tick(ticks: &[f64], at: f64) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, tick) in ticks.iter().enumerate() {
        let dist = (tick - at).abs();
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best
}

pub struct ResidualQuantizer {
    embedding: Embedding,
    phis: PhiPool,
    z_channels: usize,
}

impl ResidualQuantizer {
    pub fn new(
        vocab_size: usize,
        z_channels: usize,
        quant_resi: f64,
        share_quant_resi: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embedding = candle_nn::embedding(vocab_size, z_channels, vb.pp("embedding"))?;
        let vb_resi = vb.pp("quant_resi").pp("qresi_ls");
        let filters = (0..share_quant_resi)
            .map(|k| Phi::new(z_channels, quant_resi, vb_resi.pp(k)))
            .collect::<Result<Vec<_>>>()?;
        let phis = PhiPool::new(filters).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        Ok(Self {
            embedding,
            phis,
            z_channels,
        })
    }

    pub fn z_channels(&self) -> usize {
        self.z_channels
    }

    pub fn dtype(&self) -> DType {
        self.embedding.embeddings().dtype()
    }

    pub fn filters(&self) -> &PhiPool {
        &self.phis
    }

    /// Codes `[B, pn²]` → spatial patch `[B, Cvae, pn, pn]`.
    pub fn lookup(&self, indices: &Tensor, pn: usize) -> Result<Tensor> {
        let b_sz = indices.dim(0)?;
        self.embedding
            .forward(indices)?
            .transpose(1, 2)?
            .reshape((b_sz, self.z_channels, pn, pn))
    }

    /// Add scale `si`'s patch into `f_hat` and derive the next scale's input.
    ///
    /// Returns `(f_hat, next_map)`. Before the last scale `next_map` is the
    /// accumulator area-resampled to the next resolution; at the last scale
    /// it is the accumulator itself.
    pub fn next_autoregressive_input(
        &self,
        schedule: &ScaleSchedule,
        si: usize,
        f_hat: &Tensor,
        h: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let max_pn = schedule.max_patch_num();
        let phi = self.phis.get(schedule.progress(si));

        if schedule.is_last(si) {
            let f_hat = (f_hat + phi.forward(h)?)?;
            return Ok((f_hat.clone(), f_hat));
        }

        let upsampled = interpolate::bicubic(h, max_pn, max_pn)?;
        let f_hat = (f_hat + phi.forward(&upsampled)?)?;
        let next_pn = schedule.patch_num(si + 1);
        debug!(scale = si, next_pn, "refined accumulator");
        let next = interpolate::area(&f_hat, next_pn, next_pn)?;
        Ok((f_hat, next))
    }
}
