use std::sync::atomic::AtomicBool;

use ::image::RgbImage;
use candle_core::{Device, Tensor};
use tracing::info;

use crate::engine::{GenerationRequest, ImageGenerator};
use crate::generation::{self, GenerationError, GenerationOutput};
use crate::image::tensor_to_images;
use crate::model::VarTransformer;
use crate::sampling::ConfigError;
use crate::text_encoder::TextEncoder;
use crate::vae::LatentDecoder;

/// Default cap on prompts per call.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 8;

/// Prompt → image: text encoder, multi-scale decoder, latent decoder.
///
/// Constructed once and shared; every call builds its own cache and
/// accumulator, so `&self` methods are safe to call concurrently.
pub struct TextToImagePipeline {
    text_encoder: Box<dyn TextEncoder>,
    model: VarTransformer,
    vae: Box<dyn LatentDecoder>,
    device: Device,
    max_batch_size: usize,
}

impl TextToImagePipeline {
    pub fn new(
        text_encoder: Box<dyn TextEncoder>,
        model: VarTransformer,
        vae: Box<dyn LatentDecoder>,
        device: Device,
    ) -> Result<Self, GenerationError> {
        let expected = model.config().n_cond_embed;
        let got = text_encoder.embed_dim();
        if got != expected {
            return Err(ConfigError::ConditioningWidth { expected, got }.into());
        }
        Ok(Self {
            text_encoder,
            model,
            vae,
            device,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        })
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn model(&self) -> &VarTransformer {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn check_batch(&self, prompts: &[String]) -> Result<(), GenerationError> {
        if prompts.is_empty() {
            return Err(GenerationError::EmptyBatch);
        }
        if prompts.len() > self.max_batch_size {
            return Err(GenerationError::BatchTooLarge {
                requested: prompts.len(),
                max: self.max_batch_size,
            });
        }
        Ok(())
    }

    /// Encode prompts and run the scale loop.
    pub fn generate_latents(
        &self,
        request: &GenerationRequest,
        cancel: &AtomicBool,
    ) -> Result<GenerationOutput, GenerationError> {
        self.check_batch(&request.prompts)?;
        request.config.validate(self.model.vocab_size())?;

        let embed = self
            .text_encoder
            .encode(&request.prompts)?
            .to_device(&self.device)?
            .to_dtype(self.model.dtype())?;
        generation::generate_with_cancel(
            &self.model,
            self.vae.quantizer(),
            &embed,
            &request.config,
            cancel,
        )
    }

    /// Full pipeline. Output pixels are the decoder's `[-1, 1]` range mapped
    /// to `[0, 1]`, then to RGB8.
    pub fn generate_images(
        &self,
        request: &GenerationRequest,
        cancel: &AtomicBool,
    ) -> Result<Vec<RgbImage>, GenerationError> {
        let output = self.generate_latents(request, cancel)?;
        let pixels = self.decode(&output.f_hat)?;
        info!(
            prompts = request.prompts.len(),
            tokens = output.num_tokens(),
            "generated images"
        );
        Ok(tensor_to_images(&pixels)?)
    }

    fn decode(&self, f_hat: &Tensor) -> candle_core::Result<Tensor> {
        (self.vae.fhat_to_img(f_hat)? + 1.0)? * 0.5
    }
}

impl ImageGenerator for TextToImagePipeline {
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &AtomicBool,
    ) -> Result<Vec<RgbImage>, GenerationError> {
        self.generate_images(request, cancel)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}
