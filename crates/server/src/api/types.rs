use serde::{Deserialize, Serialize};
use var_core::GenerationConfig;

// ─── Sampling parameters ──────────────────────────────────────────────────

/// Sampling fields shared by the single and batch endpoints.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct SamplingFields {
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SamplingFields {
    fn default() -> Self {
        Self {
            cfg_scale: default_cfg_scale(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            seed: None,
        }
    }
}

impl SamplingFields {
    pub fn to_config(self) -> GenerationConfig {
        GenerationConfig {
            cfg_scale: self.cfg_scale,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
        }
    }
}

// ─── Single image ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(flatten)]
    pub sampling: SamplingFields,
}

/// Echo of the parameters a single image was generated with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateParameters {
    pub prompt: String,
    #[serde(flatten)]
    pub sampling: SamplingFields,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    pub prompt: String,
    pub parameters: GenerateParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Batch ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BatchGenerateRequest {
    pub prompts: Vec<String>,
    #[serde(flatten)]
    pub sampling: SamplingFields,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchImage {
    pub prompt: String,
    pub image_base64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchGenerateResponse {
    pub success: bool,
    pub count: usize,
    pub images: Vec<BatchImage>,
    pub parameters: SamplingFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Health ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub device: String,
    pub model_loaded: bool,
    pub vae_loaded: bool,
    pub clip_loaded: bool,
}

fn default_cfg_scale() -> f32 {
    1.5
}

fn default_top_k() -> usize {
    900
}

fn default_top_p() -> f32 {
    0.96
}
