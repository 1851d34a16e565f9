//! VAR: next-scale autoregressive text-to-image generation on candle.
//!
//! A prompt embedding conditions a transformer that predicts discrete latent
//! tokens one resolution at a time. Each scale's tokens are refined into a
//! running feature accumulator, which a VQVAE decoder turns into pixels.

pub mod conditioning;
pub mod config;
pub mod engine;
pub mod generation;
pub mod image;
pub mod layers;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod quantizer;
pub mod sampling;
pub mod schedule;
pub mod text_encoder;
pub mod vae;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::ModelConfig;
pub use generation::{generate, generate_with_cancel, GenerationError, GenerationOutput};
pub use pipeline::TextToImagePipeline;
pub use sampling::{ConfigError, GenerationConfig};
