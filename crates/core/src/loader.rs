use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ModelConfig;
use crate::model::VarTransformer;
use crate::pipeline::TextToImagePipeline;
use crate::text_encoder::{ClipTextConfig, ClipTextEncoder};
use crate::vae::VqVae;

/// Hub repository holding the VAR and VQVAE checkpoints.
pub const DEFAULT_MODEL_REPO: &str = "mpm751/textvar-demo";
/// Hub repository of the ViT-L-14 text tower (laion2b_s32b_b82k).
pub const DEFAULT_CLIP_REPO: &str = "laion/CLIP-ViT-L-14-laion2B-s32B-b82K";

const VAR_CHECKPOINT: &str = "ckpt_best.pth";
const VAE_CHECKPOINT: &str = "vae_ch160v4096z32.pth";
const CLIP_WEIGHTS: &str = "open_clip_model.safetensors";
const CLIP_TOKENIZER: &str = "tokenizer.json";

/// Key under which the training checkpoint stores the VAR state dict.
const VAR_STATE_KEY: &str = "model";

pub struct ModelFiles {
    pub config: ModelConfig,
    pub var_weights: PathBuf,
    pub vae_weights: PathBuf,
    pub clip_weights: PathBuf,
    pub clip_tokenizer: PathBuf,
}

/// The parts of the pipeline, in load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Vae,
    Var,
    Clip,
}

/// Downloads checkpoint files from HuggingFace Hub (or uses cache).
///
/// `config.json` is optional in the model repo; without it the reference
/// deployment's hyperparameters apply.
pub fn fetch_model(model_repo: &str, clip_repo: &str) -> anyhow::Result<ModelFiles> {
    let api = Api::new()?;
    let repo = api.repo(Repo::new(model_repo.to_string(), RepoType::Model));

    let config = match repo.get("config.json") {
        Ok(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)?,
        Err(_) => {
            info!(repo = model_repo, "no config.json, using default hyperparameters");
            ModelConfig::default()
        }
    };
    let var_weights = repo.get(VAR_CHECKPOINT)?;
    let vae_weights = repo.get(VAE_CHECKPOINT)?;

    let clip = api.repo(Repo::new(clip_repo.to_string(), RepoType::Model));
    let clip_weights = clip.get(CLIP_WEIGHTS)?;
    let clip_tokenizer = clip.get(CLIP_TOKENIZER)?;

    Ok(ModelFiles {
        config,
        var_weights,
        vae_weights,
        clip_weights,
        clip_tokenizer,
    })
}

/// Creates a VarBuilder from safetensor weight files.
pub fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> anyhow::Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Creates a VarBuilder from a single checkpoint file: mmaped safetensors,
/// or a PyTorch pickle whose state dict optionally sits under `key`.
pub fn load_checkpoint(
    path: &Path,
    key: Option<&str>,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<VarBuilder<'static>> {
    if is_safetensors(path) {
        return load_weights(&[path.to_path_buf()], dtype, device);
    }
    let tensors = candle_core::pickle::PthTensors::new(path, key)?;
    Ok(VarBuilder::from_backend(
        Box::new(tensors),
        dtype,
        device.clone(),
    ))
}

fn is_safetensors(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("safetensors")
}

/// Best available device: CUDA or Metal when compiled in, else CPU.
pub fn select_device(force_cpu: bool) -> anyhow::Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    if cfg!(feature = "cuda") {
        return Ok(Device::new_cuda(0)?);
    }
    if cfg!(feature = "metal") {
        return Ok(Device::new_metal(0)?);
    }
    Ok(Device::Cpu)
}

/// Build the full pipeline from downloaded files, calling `on_loaded` after
/// each component.
pub fn load_pipeline(
    files: &ModelFiles,
    dtype: DType,
    device: &Device,
    mut on_loaded: impl FnMut(Component),
) -> anyhow::Result<TextToImagePipeline> {
    let config = &files.config;

    let vb = load_checkpoint(&files.vae_weights, None, dtype, device)?;
    let vae = VqVae::new(config, vb)?;
    info!(path = %files.vae_weights.display(), "VQVAE loaded");
    on_loaded(Component::Vae);

    let vb = load_checkpoint(&files.var_weights, Some(VAR_STATE_KEY), dtype, device)?;
    let model = VarTransformer::new(config, vb)?;
    info!(
        depth = config.depth,
        embed_dim = config.embed_dim,
        scales = config.patch_nums.len(),
        "VAR loaded"
    );
    on_loaded(Component::Var);

    let clip_config = ClipTextConfig::default();
    let vb = load_checkpoint(&files.clip_weights, None, DType::F32, device)?;
    let encoder = ClipTextEncoder::from_files(&files.clip_tokenizer, &clip_config, vb)?;
    info!("CLIP text encoder loaded");
    on_loaded(Component::Clip);

    Ok(TextToImagePipeline::new(
        Box::new(encoder),
        model,
        Box::new(vae),
        device.clone(),
    )?)
}
