//! Integration tests for the engine over a real (tiny, random-weight)
//! text-to-image pipeline. CPU-only.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use common::{sampled_config, tiny_config};
use var_core::engine::{start_engine_with, EngineConfig, EngineError, GenerationRequest};
use var_core::model::VarTransformer;
use var_core::text_encoder::TextEncoder;
use var_core::vae::VqVae;
use var_core::{GenerationError, TextToImagePipeline};

// ─── Mock text encoder ───────────────────────────────────────────────────────

/// Maps each prompt to a fixed vector derived from its length and bytes.
struct ByteEncoder {
    width: usize,
}

impl TextEncoder for ByteEncoder {
    fn embed_dim(&self) -> usize {
        self.width
    }

    fn encode(&self, prompts: &[String]) -> Result<Tensor, GenerationError> {
        let data: Vec<f32> = prompts
            .iter()
            .flat_map(|p| {
                let sum: u32 = p.bytes().map(u32::from).sum();
                (0..self.width).map(move |j| ((sum + j as u32) as f32 * 0.29).sin())
            })
            .collect();
        Ok(Tensor::from_vec(data, (prompts.len(), self.width), &Device::Cpu)?)
    }
}

fn build_pipeline() -> (VarMap, TextToImagePipeline) {
    let device = Device::Cpu;
    let config = tiny_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = VarTransformer::new(&config, vb.pp("var")).unwrap();
    let vae = VqVae::new(&config, vb.pp("vae")).unwrap();
    let encoder = ByteEncoder {
        width: config.n_cond_embed,
    };
    let pipeline =
        TextToImagePipeline::new(Box::new(encoder), model, Box::new(vae), device).unwrap();
    (varmap, pipeline)
}

fn request(prompt: &str, seed: u64) -> GenerationRequest {
    GenerationRequest::single(prompt, sampled_config(seed))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_match_direct_calls() {
    let (_varmap, pipeline) = build_pipeline();
    let pipeline = Arc::new(pipeline);
    let prompts = ["a lighthouse", "two foxes", "blue glass", "a red bus"];

    let expected: Vec<Vec<u8>> = prompts
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let images = pipeline
                .generate_images(&request(p, i as u64), &AtomicBool::new(false))
                .unwrap();
            images[0].as_raw().clone()
        })
        .collect();

    let config = EngineConfig {
        num_workers: 3,
        max_queue_depth: 8,
    };
    let handle = start_engine_with(pipeline.clone(), config).await.unwrap();
    let tasks: Vec<_> = prompts
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let handle = handle.clone();
            let req = request(p, i as u64);
            tokio::spawn(async move { handle.generate(req).await })
        })
        .collect();

    for (task, want) in tasks.into_iter().zip(expected) {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.images.len(), 1);
        assert_eq!(result.images[0].as_raw(), &want);
    }
    let stats = handle.stats();
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn invalid_requests_surface_generation_errors() {
    let (_varmap, pipeline) = build_pipeline();
    let handle = start_engine_with(Arc::new(pipeline), EngineConfig::default())
        .await
        .unwrap();

    let mut bad = request("x", 0);
    bad.config.top_p = 1.5;
    let err = handle.generate(bad).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Generation(GenerationError::InvalidConfig(_))
    ));

    let too_many = GenerationRequest {
        prompts: vec!["p".to_string(); 9],
        config: sampled_config(0),
    };
    let err = handle.generate(too_many).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Generation(GenerationError::BatchTooLarge { requested: 9, max: 8 })
    ));
    assert_eq!(handle.stats().failed, 2);
}
