use thiserror::Error;

use crate::sampling::ConfigError;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("invalid generation config: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("batch must contain at least one prompt")]
    EmptyBatch,

    #[error("batch of {requested} exceeds the maximum of {max}")]
    BatchTooLarge { requested: usize, max: usize },

    #[error("generation cancelled before scale {scale}")]
    Cancelled { scale: usize },

    #[error("attention cache holds {found:?} positions, expected {expected}")]
    CacheMisuse {
        expected: usize,
        found: Option<usize>,
    },

    #[error("generation stopped after {completed} of {total} scales")]
    Incomplete { completed: usize, total: usize },

    #[error("text encoder error: {0}")]
    TextEncoder(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl GenerationError {
    /// Whether the error was caused by the caller's input rather than the model.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::EmptyBatch | Self::BatchTooLarge { .. }
        )
    }
}
