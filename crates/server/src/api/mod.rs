pub mod error;
pub mod generate;
pub mod health;
pub mod middleware;
pub mod types;
pub mod validation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use var_core::engine::EngineHandle;
use var_core::loader::Component;

/// Which pipeline components have finished loading.
#[derive(Debug, Default)]
pub struct LoadState {
    model: AtomicBool,
    vae: AtomicBool,
    clip: AtomicBool,
}

impl LoadState {
    pub fn mark_loaded(&self, component: Component) {
        let flag = match component {
            Component::Var => &self.model,
            Component::Vae => &self.vae,
            Component::Clip => &self.clip,
        };
        flag.store(true, Ordering::SeqCst);
    }

    pub fn model_loaded(&self) -> bool {
        self.model.load(Ordering::SeqCst)
    }

    pub fn vae_loaded(&self) -> bool {
        self.vae.load(Ordering::SeqCst)
    }

    pub fn clip_loaded(&self) -> bool {
        self.clip.load(Ordering::SeqCst)
    }

    pub fn all_loaded(&self) -> bool {
        self.model_loaded() && self.vae_loaded() && self.clip_loaded()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub load: Arc<LoadState>,
    /// Device label reported by the health endpoints.
    pub device: String,
    pub max_batch_size: usize,
    /// Whether the server is accepting new requests.
    accepting: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        engine: EngineHandle,
        load: Arc<LoadState>,
        device: String,
        max_batch_size: usize,
        accepting: Arc<AtomicBool>,
    ) -> Self {
        Self {
            engine,
            load,
            device,
            max_batch_size,
            accepting,
        }
    }

    pub fn accepting_requests(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

/// Configuration for CORS middleware.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Comma-separated allowed origins, or "*" for all.
    pub allowed_origins: String,
    /// Comma-separated allowed methods.
    pub allowed_methods: String,
    /// Comma-separated allowed headers, or "*" for all.
    pub allowed_headers: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: "*".to_string(),
            allowed_methods: "GET,POST,OPTIONS".to_string(),
            allowed_headers: "*".to_string(),
        }
    }
}

/// Build a `CorsLayer` from a `CorsConfig`.
///
/// When all three fields use their wildcard defaults ("*" for origins/headers,
/// "GET,POST,OPTIONS" for methods), this returns `CorsLayer::very_permissive()`.
/// Otherwise it parses each field into the corresponding typed values.
pub fn build_cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.allowed_origins == "*"
        && config.allowed_headers == "*"
        && config.allowed_methods == "GET,POST,OPTIONS"
    {
        return CorsLayer::very_permissive();
    }

    let mut layer = CorsLayer::new();

    // Origins
    if config.allowed_origins == "*" {
        layer = layer.allow_origin(AllowOrigin::any());
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .split(',')
            .filter_map(|s| {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return None;
                }
                HeaderValue::from_str(trimmed).ok()
            })
            .collect();
        layer = layer.allow_origin(origins);
    }

    // Methods
    let methods: Vec<Method> = config
        .allowed_methods
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<Method>().ok()
        })
        .collect();
    layer = layer.allow_methods(AllowMethods::list(methods));

    // Headers
    if config.allowed_headers == "*" {
        layer = layer.allow_headers(AllowHeaders::any());
    } else {
        let headers: Vec<HeaderName> = config
            .allowed_headers
            .split(',')
            .filter_map(|s| {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return None;
                }
                trimmed.parse::<HeaderName>().ok()
            })
            .collect();
        layer = layer.allow_headers(AllowHeaders::list(headers));
    }

    layer
}

pub fn create_router(state: AppState) -> Router {
    create_router_with_cors(state, CorsLayer::very_permissive())
}

pub fn create_router_with_cors(state: AppState, cors: CorsLayer) -> Router {
    let accepting = state.accepting.clone();
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/generate", post(generate::generate))
        .route("/generate/image", post(generate::generate_image))
        .route("/generate/batch", post(generate::generate_batch))
        .layer(axum::middleware::from_fn_with_state(
            accepting,
            middleware::reject_while_draining,
        ))
        .layer(axum::middleware::from_fn(middleware::log_requests))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;
    use var_core::engine::{start_engine, start_engine_with, EngineConfig};
    use var_core::testing::MockGenerator;

    const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    fn loaded() -> Arc<LoadState> {
        let load = Arc::new(LoadState::default());
        for c in [Component::Vae, Component::Var, Component::Clip] {
            load.mark_loaded(c);
        }
        load
    }

    async fn ready_state() -> AppState {
        ready_state_with(MockGenerator::new(4)).await
    }

    async fn ready_state_with(generator: MockGenerator) -> AppState {
        let engine = start_engine_with(Arc::new(generator), EngineConfig::default())
            .await
            .unwrap();
        AppState::new(
            engine,
            loaded(),
            "cpu".to_string(),
            8,
            Arc::new(AtomicBool::new(true)),
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_not_ready_while_loading() {
        let state = AppState::new(
            start_engine(EngineConfig::default()),
            Arc::new(LoadState::default()),
            "cpu".to_string(),
            8,
            Arc::new(AtomicBool::new(true)),
        );
        state.load.mark_loaded(Component::Vae);
        let app = create_router(state);

        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "not ready");
        assert_eq!(json["vae_loaded"], true);
        assert_eq!(json["model_loaded"], false);
        assert_eq!(json["device"], "cpu");

        let resp = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["status"], "healthy");
    }

    #[tokio::test]
    async fn health_reports_healthy_when_loaded() {
        let app = create_router(ready_state().await);
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["clip_loaded"], true);
    }

    #[tokio::test]
    async fn generate_returns_base64_png() {
        let app = create_router(ready_state().await);
        let resp = app
            .oneshot(post_json(
                "/generate",
                serde_json::json!({"prompt": "a red fox", "seed": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["prompt"], "a red fox");
        assert_eq!(json["parameters"]["prompt"], "a red fox");
        assert_eq!(json["parameters"]["cfg_scale"], 1.5);
        assert_eq!(json["parameters"]["top_k"], 900);
        assert_eq!(json["parameters"]["seed"], 3);
        assert!(json["image_base64"]
            .as_str()
            .unwrap()
            .starts_with("iVBORw0KGgo"));
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn generate_image_returns_png_attachment() {
        let app = create_router(ready_state().await);
        let resp = app
            .oneshot(post_json(
                "/generate/image",
                serde_json::json!({"prompt": "a red fox"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=generated_image.png"
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..8], &PNG_SIGNATURE);
    }

    #[tokio::test]
    async fn batch_returns_one_image_per_prompt() {
        let app = create_router(ready_state().await);
        let resp = app
            .oneshot(post_json(
                "/generate/batch",
                serde_json::json!({"prompts": ["a", "bb", "ccc"], "top_k": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["count"], 3);
        assert_eq!(json["images"][1]["prompt"], "bb");
        assert_eq!(json["parameters"]["top_k"], 0);
        assert!(json["parameters"].get("prompt").is_none());
    }

    #[tokio::test]
    async fn batch_over_limit_is_rejected() {
        let app = create_router(ready_state().await);
        let prompts: Vec<String> = (0..9).map(|i| format!("p{i}")).collect();
        let resp = app
            .oneshot(post_json(
                "/generate/batch",
                serde_json::json!({ "prompts": prompts }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("Maximum 8"));
    }

    #[tokio::test]
    async fn out_of_range_parameters_are_rejected() {
        let app = create_router(ready_state().await);
        for body in [
            serde_json::json!({"prompt": "x", "cfg_scale": 11.0}),
            serde_json::json!({"prompt": "x", "top_k": 5000}),
            serde_json::json!({"prompt": "x", "top_p": 1.5}),
            serde_json::json!({"prompt": ""}),
        ] {
            let resp = app.clone().oneshot(post_json("/generate", body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn generate_before_load_is_unavailable() {
        let state = AppState::new(
            start_engine(EngineConfig::default()),
            Arc::new(LoadState::default()),
            "cpu".to_string(),
            8,
            Arc::new(AtomicBool::new(true)),
        );
        let resp = create_router(state)
            .oneshot(post_json("/generate", serde_json::json!({"prompt": "x"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Model not loaded");
    }

    #[tokio::test]
    async fn draining_server_rejects_every_route() {
        let state = ready_state().await;
        state.accepting.store(false, Ordering::SeqCst);
        let app = create_router(state);
        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let resp = app
            .oneshot(post_json("/generate", serde_json::json!({"prompt": "x"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_requests_are_served() {
        let state =
            ready_state_with(MockGenerator::new(2).with_delay(Duration::from_millis(20))).await;
        let app = create_router(state.clone());
        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let app = app.clone();
                tokio::spawn(async move {
                    app.oneshot(post_json(
                        "/generate",
                        serde_json::json!({ "prompt": format!("prompt {i}") }),
                    ))
                    .await
                    .unwrap()
                    .status()
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), StatusCode::OK);
        }
        assert_eq!(state.engine.stats().completed, 4);
    }

    #[test]
    fn cors_default_is_permissive() {
        let config = CorsConfig::default();
        assert_eq!(config.allowed_origins, "*");
        let _layer = build_cors_layer(&config);
    }

    #[test]
    fn cors_explicit_lists_parse() {
        let config = CorsConfig {
            allowed_origins: "http://localhost:3000, https://example.com".to_string(),
            allowed_methods: "GET,POST".to_string(),
            allowed_headers: "content-type".to_string(),
        };
        let _layer = build_cors_layer(&config);
    }
}
