//! Image generation endpoints.
//!
//! # Example Request
//!
//! ```json
//! {
//!   "prompt": "a watercolor lighthouse at dusk",
//!   "cfg_scale": 1.5,
//!   "top_k": 900,
//!   "top_p": 0.96,
//!   "seed": 42
//! }
//! ```
//!
//! `/generate` and `/generate/batch` return base64 PNGs in JSON;
//! `/generate/image` returns the PNG itself.

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use var_core::engine::{GenerationRequest, GenerationResult};

use super::error::ApiError;
use super::types::{
    BatchGenerateRequest, BatchGenerateResponse, BatchImage, GenerateParameters, GenerateRequest,
    GenerateResponse,
};
use super::validation::{validate_batch_request, validate_generate_request};
use super::AppState;

fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut result = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as usize;
        let b1 = chunk.get(1).copied().unwrap_or(0) as usize;
        let b2 = chunk.get(2).copied().unwrap_or(0) as usize;

        result.push(ALPHABET[b0 >> 2] as char);
        result.push(ALPHABET[((b0 & 0x03) << 4) | (b1 >> 4)] as char);
        if chunk.len() > 1 {
            result.push(ALPHABET[((b1 & 0x0f) << 2) | (b2 >> 6)] as char);
        } else {
            result.push('=');
        }
        if chunk.len() > 2 {
            result.push(ALPHABET[b2 & 0x3f] as char);
        } else {
            result.push('=');
        }
    }
    result
}

fn encode_png(image: &image::RgbImage) -> Result<Vec<u8>, ApiError> {
    var_core::image::encode_png(image)
        .map_err(|e| ApiError::GenerationFailed(format!("PNG encoding failed: {e}")))
}

async fn generate_one(
    state: &AppState,
    request: &GenerateRequest,
) -> Result<Vec<u8>, ApiError> {
    validate_generate_request(request)?;
    let GenerationResult { images, elapsed } = state
        .engine
        .generate(GenerationRequest::single(
            request.prompt.clone(),
            request.sampling.to_config(),
        ))
        .await?;
    tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "image generated");
    let image = images
        .first()
        .ok_or_else(|| ApiError::GenerationFailed("no image produced".to_string()))?;
    encode_png(image)
}

/// Generate one image and return it base64-encoded.
///
/// POST /generate
pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let png = generate_one(&state, &request).await?;
    Ok(Json(GenerateResponse {
        success: true,
        image_base64: Some(base64_encode(&png)),
        prompt: request.prompt.clone(),
        parameters: GenerateParameters {
            prompt: request.prompt,
            sampling: request.sampling,
        },
        error: None,
    }))
}

/// Generate one image and return it as a PNG download.
///
/// POST /generate/image
pub async fn generate_image(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let png = generate_one(&state, &request).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=generated_image.png",
            ),
        ],
        png,
    )
        .into_response())
}

/// Generate one image per prompt in a single batch.
///
/// POST /generate/batch
pub async fn generate_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchGenerateRequest>,
) -> Result<Json<BatchGenerateResponse>, ApiError> {
    validate_batch_request(&request, state.max_batch_size)?;
    let result = state
        .engine
        .generate(GenerationRequest {
            prompts: request.prompts.clone(),
            config: request.sampling.to_config(),
        })
        .await?;
    tracing::info!(
        count = result.images.len(),
        elapsed_ms = result.elapsed.as_millis() as u64,
        "batch generated"
    );

    let images = request
        .prompts
        .into_iter()
        .zip(result.images.iter())
        .map(|(prompt, image)| {
            Ok(BatchImage {
                prompt,
                image_base64: base64_encode(&encode_png(image)?),
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(Json(BatchGenerateResponse {
        success: true,
        count: images.len(),
        images,
        parameters: request.sampling,
        error: None,
    }))
}
