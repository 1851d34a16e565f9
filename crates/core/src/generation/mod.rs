//! Coarse-to-fine autoregressive decoding.
//!
//! [`ScaleLoop`] is the explicit state machine: one [`ScaleLoop::step`]
//! samples one scale. [`generate`] drives it to completion with a cache it
//! owns, so every call starts from an empty cache and drops it on return.

mod error;

pub use error::GenerationError;

use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::Tensor;
use tracing::{debug, info_span};

use crate::layers::GenerationCache;
use crate::model::VarTransformer;
use crate::quantizer::ResidualQuantizer;
use crate::sampling::{self, ConfigError, GenerationConfig, SamplerState};

/// Where the loop is after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleState {
    /// Ready to sample this scale next.
    Pending(usize),
    Terminal,
}

/// Result of a completed generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Latent accumulator `[B, Cvae, pn_max, pn_max]`.
    pub f_hat: Tensor,
    /// Sampled codes per scale, `[B, pn²]` each.
    pub indices: Vec<Tensor>,
}

impl GenerationOutput {
    /// Total sampled tokens per batch row.
    pub fn num_tokens(&self) -> usize {
        self.indices
            .iter()
            .map(|idx| idx.dims().get(1).copied().unwrap_or(0))
            .sum()
    }
}

/// State of one generation call, advanced one scale at a time.
pub struct ScaleLoop<'a> {
    model: &'a VarTransformer,
    quantizer: &'a ResidualQuantizer,
    config: GenerationConfig,
    sampler: SamplerState,
    cond: Tensor,
    token_map: Tensor,
    f_hat: Tensor,
    batch: usize,
    state: ScaleState,
    tokens_seen: usize,
    indices: Vec<Tensor>,
}

impl<'a> ScaleLoop<'a> {
    /// Validate inputs and build the first scale's token map.
    ///
    /// `embed` is `[B, n_cond]`; the config is checked against the model's
    /// vocabulary before any tensor work.
    pub fn new(
        model: &'a VarTransformer,
        quantizer: &'a ResidualQuantizer,
        embed: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Self, GenerationError> {
        config.validate(model.vocab_size())?;

        let (batch, width) = embed.dims2()?;
        if batch == 0 {
            return Err(GenerationError::EmptyBatch);
        }
        let expected = model.conditioning().n_cond_embed();
        if width != expected {
            return Err(ConfigError::ConditioningWidth {
                expected,
                got: width,
            }
            .into());
        }

        let schedule = model.schedule();
        let cond = model.conditioning().mix(embed)?;
        let token_map = model.conditioning().first_token_map(schedule, &cond)?;
        let max_pn = schedule.max_patch_num();
        let f_hat = Tensor::zeros(
            (batch, quantizer.z_channels(), max_pn, max_pn),
            quantizer.dtype(),
            embed.device(),
        )?;

        Ok(Self {
            model,
            quantizer,
            config: config.clone(),
            sampler: SamplerState::new(config.seed),
            cond,
            token_map,
            f_hat,
            batch,
            state: ScaleState::Pending(0),
            tokens_seen: 0,
            indices: Vec::with_capacity(schedule.num_scales()),
        })
    }

    pub fn state(&self) -> ScaleState {
        self.state
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    /// Tokens per batch row processed so far.
    pub fn tokens_seen(&self) -> usize {
        self.tokens_seen
    }

    /// Sample the pending scale. `cache` must hold exactly the keys/values of
    /// the scales this loop has already processed.
    pub fn step(&mut self, cache: &mut GenerationCache) -> Result<ScaleState, GenerationError> {
        let si = match self.state {
            ScaleState::Pending(si) => si,
            ScaleState::Terminal => return Ok(ScaleState::Terminal),
        };
        match cache.seq_len() {
            Some(len) if len == self.tokens_seen => {}
            found => {
                return Err(GenerationError::CacheMisuse {
                    expected: self.tokens_seen,
                    found,
                })
            }
        }

        let schedule = self.model.schedule();
        let pn = schedule.patch_num(si);

        // Step 1: attention stack over this scale's token map
        let logits = self.model.forward_step(&self.token_map, &self.cond, cache)?;

        // Step 2: guidance, filtering and draw
        let t = sampling::guidance_strength(self.config.cfg_scale, schedule.progress(si));
        let logits = sampling::apply_guidance(&logits, t)?;
        let idx = sampling::sample_scale(&logits, &self.config, &mut self.sampler)?;

        // Step 3: refine the accumulator
        let h = self.quantizer.lookup(&idx, pn)?;
        let (f_hat, next_map) =
            self.quantizer
                .next_autoregressive_input(schedule, si, &self.f_hat, &h)?;
        self.f_hat = f_hat;
        self.tokens_seen += pn * pn;
        self.indices.push(idx);
        debug!(scale = si, pn, guidance = t, tokens = self.tokens_seen, "sampled scale");

        // Step 4: next scale's input, duplicated for the guidance batch
        if schedule.is_last(si) {
            self.state = ScaleState::Terminal;
        } else {
            self.token_map = self
                .model
                .embed_scale_input(&next_map, si + 1)?
                .repeat((2, 1, 1))?;
            self.state = ScaleState::Pending(si + 1);
        }
        Ok(self.state)
    }

    pub fn finish(self) -> Result<GenerationOutput, GenerationError> {
        if self.state != ScaleState::Terminal {
            return Err(GenerationError::Incomplete {
                completed: self.indices.len(),
                total: self.model.schedule().num_scales(),
            });
        }
        Ok(GenerationOutput {
            f_hat: self.f_hat,
            indices: self.indices,
        })
    }
}

/// Decode `embed` `[B, n_cond]` into a latent accumulator.
pub fn generate(
    model: &VarTransformer,
    quantizer: &ResidualQuantizer,
    embed: &Tensor,
    config: &GenerationConfig,
) -> Result<GenerationOutput, GenerationError> {
    generate_with_cancel(model, quantizer, embed, config, &AtomicBool::new(false))
}

/// [`generate`], checking `cancel` before every scale.
pub fn generate_with_cancel(
    model: &VarTransformer,
    quantizer: &ResidualQuantizer,
    embed: &Tensor,
    config: &GenerationConfig,
    cancel: &AtomicBool,
) -> Result<GenerationOutput, GenerationError> {
    let span = info_span!(
        "generate",
        batch = embed.dims().first().copied().unwrap_or(0),
        scales = model.schedule().num_scales(),
        seed = ?config.seed,
    );
    let _enter = span.enter();

    let mut scale_loop = ScaleLoop::new(model, quantizer, embed, config)?;
    let mut cache = model.new_cache();

    while let ScaleState::Pending(si) = scale_loop.state() {
        if cancel.load(Ordering::Relaxed) {
            debug!(scale = si, "generation cancelled");
            return Err(GenerationError::Cancelled { scale: si });
        }
        scale_loop.step(&mut cache)?;
    }

    debug_assert_eq!(cache.seq_len(), Some(model.schedule().total_len()));
    scale_loop.finish()
}
