//! Shared test utilities for var-core.
//!
//! Tiny configurations, randomly initialised models and mock collaborators
//! for CPU-only tests.

mod mocks;
mod tiny_config;

pub use mocks::{HashTextEncoder, MockGenerator};
pub use tiny_config::{tiny_model_config, tiny_pipeline, TinyVar};
