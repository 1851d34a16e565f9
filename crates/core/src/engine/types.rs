//! Core types for the generation engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::generation::GenerationError;
use crate::sampling::GenerationConfig;

// ─── Generator seam ───────────────────────────────────────────────────────

/// Anything that turns prompts into images. Implementations must tolerate
/// concurrent calls through `&self`.
pub trait ImageGenerator: Send + Sync + 'static {
    /// Generate one image per prompt. Returns `GenerationError::Cancelled`
    /// once `cancel` is observed set.
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &AtomicBool,
    ) -> Result<Vec<RgbImage>, GenerationError>;

    fn max_batch_size(&self) -> usize;
}

// ─── Engine errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model not loaded")]
    NotReady,
    #[error("generation queue is full")]
    QueueFull,
    #[error("engine has shut down")]
    Shutdown,
    #[error("worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl EngineError {
    /// Transient conditions a client may retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            EngineError::NotReady | EngineError::QueueFull | EngineError::Shutdown
        )
    }
}

// ─── Request/Response types ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompts: Vec<String>,
    pub config: GenerationConfig,
}

impl GenerationRequest {
    pub fn single(prompt: impl Into<String>, config: GenerationConfig) -> Self {
        Self {
            prompts: vec![prompt.into()],
            config,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub images: Vec<RgbImage>,
    pub elapsed: Duration,
}

// ─── Engine configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Generations allowed to run at once.
    pub num_workers: usize,
    /// Requests allowed to wait for a worker before `QueueFull`.
    pub max_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            max_queue_depth: 16,
        }
    }
}

// ─── Engine Stats ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EngineStats {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub in_flight: u64,
    pub ready: bool,
}

/// Counters shared by the handle and the engine loop.
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub rejected: AtomicU64,
    pub in_flight: AtomicU64,
    pub ready: AtomicBool,
}

impl EngineCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            ready: self.ready.load(Ordering::Acquire),
        }
    }
}

// ─── Engine commands ──────────────────────────────────────────────────────

pub(crate) enum EngineCommand {
    Generate {
        request: GenerationRequest,
        cancel: Arc<AtomicBool>,
        response_tx: oneshot::Sender<Result<GenerationResult, EngineError>>,
    },
    /// Make a generator available; requests before this see `NotReady`.
    Install {
        generator: Arc<dyn ImageGenerator>,
        response_tx: oneshot::Sender<()>,
    },
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_errors() {
        assert!(EngineError::NotReady.is_unavailable());
        assert!(EngineError::QueueFull.is_unavailable());
        assert!(!EngineError::Generation(GenerationError::EmptyBatch).is_unavailable());
    }

    #[test]
    fn snapshot_reads_counters() {
        let counters = EngineCounters::default();
        EngineCounters::bump(&counters.completed);
        EngineCounters::bump(&counters.completed);
        EngineCounters::bump(&counters.rejected);
        counters.ready.store(true, Ordering::Release);

        let stats = counters.snapshot();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.failed, 0);
        assert!(stats.ready);
    }
}
