use axum::extract::State;
use axum::Json;

use super::types::HealthResponse;
use super::AppState;

fn health_response(state: &AppState, status: &str) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        device: state.device.clone(),
        model_loaded: state.load.model_loaded(),
        vae_loaded: state.load.vae_loaded(),
        clip_loaded: state.load.clip_loaded(),
    }
}

/// Liveness: answers `healthy` as soon as the listener is up.
///
/// GET /
pub async fn root(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health_response(&state, "healthy"))
}

/// Readiness: `healthy` once every component is loaded and the engine runs.
///
/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.load.all_loaded() && state.engine.is_ready() {
        "healthy"
    } else {
        "not ready"
    };
    Json(health_response(&state, status))
}
