use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ::image::{Rgb, RgbImage};
use candle_core::{Device, Tensor};

use crate::engine::{GenerationRequest, ImageGenerator};
use crate::generation::GenerationError;
use crate::text_encoder::TextEncoder;

/// Deterministic text encoder: each prompt hashes to a fixed unit vector.
pub struct HashTextEncoder {
    embed_dim: usize,
    device: Device,
}

impl HashTextEncoder {
    pub fn new(embed_dim: usize, device: Device) -> Self {
        Self { embed_dim, device }
    }

    fn row(&self, prompt: &str) -> Vec<f32> {
        // FNV-1a
        let hash = prompt
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
                (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
            });
        let seed = (hash % 10_007) as f32;
        let row: Vec<f32> = (0..self.embed_dim)
            .map(|j| ((seed + j as f32) * 0.37).sin())
            .collect();
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-6);
        row.into_iter().map(|v| v / norm).collect()
    }
}

impl TextEncoder for HashTextEncoder {
    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn encode(&self, prompts: &[String]) -> Result<Tensor, GenerationError> {
        let data: Vec<f32> = prompts.iter().flat_map(|p| self.row(p)).collect();
        Ok(Tensor::from_vec(
            data,
            (prompts.len(), self.embed_dim),
            &self.device,
        )?)
    }
}

/// Generator that paints solid squares, optionally after a cancellable
/// delay, and records how many calls overlapped.
pub struct MockGenerator {
    side: u32,
    delay: Duration,
    max_batch_size: usize,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockGenerator {
    pub fn new(side: u32) -> Self {
        Self {
            side,
            delay: Duration::ZERO,
            max_batch_size: 8,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running calls observed.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn run(
        &self,
        request: &GenerationRequest,
        cancel: &AtomicBool,
    ) -> Result<Vec<RgbImage>, GenerationError> {
        if request.prompts.is_empty() {
            return Err(GenerationError::EmptyBatch);
        }
        if request.prompts.len() > self.max_batch_size {
            return Err(GenerationError::BatchTooLarge {
                requested: request.prompts.len(),
                max: self.max_batch_size,
            });
        }
        let start = Instant::now();
        while start.elapsed() < self.delay {
            if cancel.load(Ordering::Acquire) {
                return Err(GenerationError::Cancelled { scale: 0 });
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(request
            .prompts
            .iter()
            .map(|p| {
                let shade = (p.len() % 256) as u8;
                RgbImage::from_pixel(self.side, self.side, Rgb([shade, 0, 255 - shade]))
            })
            .collect())
    }
}

impl ImageGenerator for MockGenerator {
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &AtomicBool,
    ) -> Result<Vec<RgbImage>, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let result = self.run(request, cancel);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}
