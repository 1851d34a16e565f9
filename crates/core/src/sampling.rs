use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected generation inputs. Raised before any tensor work starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("cfg_scale must be >= 1.0, got {0}")]
    GuidanceScale(f32),

    #[error("top_k must be between 0 and {vocab_size}, got {top_k}")]
    TopK { top_k: usize, vocab_size: usize },

    #[error("top_p must be between 0 and 1, got {0}")]
    TopP(f32),

    #[error("conditioning width must be {expected}, got {got}")]
    ConditioningWidth { expected: usize, got: usize },

    #[error("refinement filter pool must not be empty")]
    EmptyFilterPool,

    #[error("scale schedule is empty")]
    EmptySchedule,

    #[error("scale schedule must be strictly increasing, got {0:?}")]
    NonIncreasingSchedule(Vec<usize>),
}

/// Parameters of one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Classifier-free guidance scale, >= 1.0.
    pub cfg_scale: f32,
    /// Top-K filtering. 0 = disabled.
    pub top_k: usize,
    /// Nucleus threshold in [0, 1]. 0 = disabled.
    pub top_p: f32,
    /// Optional seed for deterministic sampling.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            cfg_scale: 1.5,
            top_k: 900,
            top_p: 0.96,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Argmax decoding at every token.
    pub fn greedy() -> Self {
        Self {
            cfg_scale: 1.0,
            top_k: 1,
            top_p: 0.0,
            seed: None,
        }
    }

    /// Plain categorical sampling from the full softmax.
    pub fn unfiltered(seed: Option<u64>) -> Self {
        Self {
            cfg_scale: 1.0,
            top_k: 0,
            top_p: 0.0,
            seed,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self, vocab_size: usize) -> Result<(), ConfigError> {
        // written so that NaN fails every check
        if !(self.cfg_scale >= 1.0) || !self.cfg_scale.is_finite() {
            return Err(ConfigError::GuidanceScale(self.cfg_scale));
        }
        if self.top_k > vocab_size {
            return Err(ConfigError::TopK {
                top_k: self.top_k,
                vocab_size,
            });
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ConfigError::TopP(self.top_p));
        }
        Ok(())
    }
}

/// Mutable state for sampling. One per generation call; seeding it once
/// makes the filtering and every draw of the call reproducible.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

/// Effective guidance strength at a scale: `cfg_scale * si / (S - 1)`.
///
/// Zero at the first scale, the full scale at the last.
pub fn guidance_strength(cfg_scale: f32, progress: f64) -> f32 {
    cfg_scale * progress as f32
}

/// Blend the conditional and unconditional halves of a `[2B, l, V]` logits
/// tensor into `[B, l, V]`: `(1 + t) * cond - t * uncond`.
pub fn apply_guidance(logits: &Tensor, t: f32) -> candle_core::Result<Tensor> {
    let doubled = logits.dim(0)?;
    if doubled % 2 != 0 {
        candle_core::bail!("guidance expects an even batch, got {doubled}");
    }
    let batch = doubled / 2;
    let cond = logits.narrow(0, 0, batch)?;
    let uncond = logits.narrow(0, batch, batch)?;
    cond.affine(1.0 + t as f64, 0.0)? - uncond.affine(t as f64, 0.0)?
}

/// Sample one token per row of a guided `[B, l, V]` logits tensor.
///
/// Returns a `[B, l]` U32 tensor on the logits' device. Rows are filtered
/// and drawn independently, in row-major order, from the shared RNG.
pub fn sample_scale(
    logits: &Tensor,
    config: &GenerationConfig,
    state: &mut SamplerState,
) -> candle_core::Result<Tensor> {
    let (batch, len, vocab_size) = logits.dims3()?;
    let data: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

    let token_ids: Vec<u32> = data
        .chunks(vocab_size)
        .map(|row| sample_logits(row, config, state))
        .collect();

    Tensor::from_vec(token_ids, (batch, len), logits.device())
}

/// Sample a token from one row of logits.
///
/// The highest-scoring entry survives every filter, so a row can never be
/// masked out completely.
pub fn sample_logits(logits: &[f32], config: &GenerationConfig, state: &mut SamplerState) -> u32 {
    let mut logits = logits.to_vec();

    // Step 1: top-k on raw logits
    if config.top_k > 0 {
        apply_top_k(&mut logits, config.top_k);
    }

    // Step 2: top-p on the (possibly truncated) distribution
    if config.top_p > 0.0 {
        apply_top_p(&mut logits, config.top_p);
    }

    // Step 3: draw
    let probs = softmax(&logits);
    sample_from_probs(&probs, &mut state.rng)
}

/// Mask (to `-inf`) every entry below the k-th largest logit. Ties with the
/// k-th value are kept.
pub fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut values = logits.to_vec();
    let (_, kth, _) = values.select_nth_unstable_by(k - 1, |a, b| {
        b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal)
    });
    let threshold = *kth;
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Nucleus filtering: mask entries whose cumulative probability mass before
/// inclusion exceeds `top_p`. The top entry is always kept.
pub fn apply_top_p(logits: &mut [f32], top_p: f32) {
    if top_p <= 0.0 || top_p >= 1.0 || logits.is_empty() {
        return;
    }

    let mut indexed: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let sorted: Vec<f32> = indexed.iter().map(|&(_, l)| l).collect();
    let probs = softmax(&sorted);

    let mut mass_before = 0.0f32;
    for (rank, (&(idx, _), &p)) in indexed.iter().zip(probs.iter()).enumerate() {
        if rank > 0 && mass_before > top_p {
            logits[idx] = f32::NEG_INFINITY;
        }
        mass_before += p;
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    let mut last_nonzero = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumsum += p;
        last_nonzero = i;
        if r < cumsum {
            return i as u32;
        }
    }
    // rounding left r above the total mass
    last_nonzero as u32
}
