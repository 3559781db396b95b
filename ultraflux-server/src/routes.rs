use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::error;
use ultraflux_core::{GenerateRequest, GenerateResponse, Health, ImageService, Loader, ServiceError};

/// Error body in the `{"detail": ...}` shape clients expect.
#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

struct ApiError(StatusCode, String);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            err if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status != StatusCode::UNPROCESSABLE_ENTITY {
            error!("Error generating image: {err}");
        }
        Self(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { detail: self.1 })).into_response()
    }
}

pub fn router<L: Loader>(service: Arc<ImageService<L>>) -> Router {
    Router::new()
        .route("/", get(root::<L>))
        .route("/healthz", get(healthz::<L>))
        .route("/generate", post(generate_image_handler::<L>))
        .with_state(service)
}

async fn root<L: Loader>(State(service): State<Arc<ImageService<L>>>) -> impl IntoResponse {
    let config = service.config();
    Json(json!({
        "message": "UltraFlux inference service is running.",
        "model_id": config.model_id,
        "device": config.device.to_string(),
    }))
}

async fn healthz<L: Loader>(State(service): State<Arc<ImageService<L>>>) -> Json<Health> {
    Json(service.health())
}

async fn generate_image_handler<L: Loader>(
    State(service): State<Arc<ImageService<L>>>,
    req: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(req) = req?;
    Ok(Json(service.generate(req).await?))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use anyhow::{bail, Result};
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use image::DynamicImage;
    use serde_json::Value;
    use tower::ServiceExt;
    use ultraflux_core::{GenerationRequest, ModelLike, PipelineConfig, ServiceConfig};

    use super::*;

    struct StubModel {
        runs: Arc<AtomicUsize>,
    }

    impl ModelLike for StubModel {
        fn run(&self, request: &GenerationRequest) -> Result<DynamicImage> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match request.prompt.as_str() {
                "oom" => bail!("CUDA_ERROR_OUT_OF_MEMORY: out of memory"),
                "boom" => bail!("unexpected tensor shape"),
                _ => Ok(DynamicImage::new_rgb8(8, 8)),
            }
        }
    }

    /// Holds construction until `release` is set.
    struct StubLoader {
        runs: Arc<AtomicUsize>,
        release: Arc<AtomicBool>,
    }

    impl Loader for StubLoader {
        type Model = StubModel;

        async fn load(&self, _config: PipelineConfig) -> Result<StubModel> {
            while !self.release.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(StubModel {
                runs: self.runs.clone(),
            })
        }
    }

    struct Harness {
        service: Arc<ImageService<StubLoader>>,
        runs: Arc<AtomicUsize>,
        release: Arc<AtomicBool>,
        _dir: tempfile::TempDir,
    }

    fn harness(released: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(AtomicBool::new(released));
        let mut config = ServiceConfig {
            results_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.pipeline.device = "cpu".parse().unwrap();
        let loader = StubLoader {
            runs: runs.clone(),
            release: release.clone(),
        };
        Harness {
            service: Arc::new(ImageService::new(loader, config).unwrap()),
            runs,
            release,
            _dir: dir,
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn generate_req(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/generate")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn root_reports_model_and_device() {
        let h = harness(true);
        let (status, body) = send(router(h.service.clone()), get_req("/")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model_id"], "Owen777/UltraFlux-v1");
        assert_eq!(body["device"], "cpu");
        assert!(body["message"].as_str().unwrap().contains("running"));
    }

    #[tokio::test]
    async fn healthz_reports_initializing_until_loaded() {
        let h = harness(false);

        let (status, body) = send(router(h.service.clone()), get_req("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "initializing");
        assert_eq!(body["device"], "cpu");

        let warm = {
            let service = h.service.clone();
            tokio::spawn(async move { service.warm_up().await })
        };
        let (_, body) = send(router(h.service.clone()), get_req("/healthz")).await;
        assert_eq!(body["status"], "initializing");

        h.release.store(true, Ordering::SeqCst);
        warm.await.unwrap().unwrap();

        let (_, body) = send(router(h.service.clone()), get_req("/healthz")).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn generate_echoes_prompt_and_seed() {
        let h = harness(true);
        let request = json!({
            "prompt": "a lighthouse at dusk",
            "height": 512,
            "width": 768,
            "num_inference_steps": 20,
            "guidance_scale": 3.5,
            "seed": 77
        });

        let (status, first) = send(router(h.service.clone()), generate_req(request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (_, second) = send(router(h.service.clone()), generate_req(request)).await;

        assert_eq!(first["prompt"], "a lighthouse at dusk");
        assert_eq!(first["seed"], 77);
        assert_eq!(second["seed"], 77);
        let path = first["image_path"].as_str().unwrap();
        assert!(path.ends_with(".jpeg"));
        assert!(std::path::Path::new(path).exists());
    }

    #[tokio::test]
    async fn generate_draws_a_seed_when_missing() {
        let h = harness(true);
        let (status, body) = send(
            router(h.service.clone()),
            generate_req(json!({"prompt": "a lighthouse", "height": 256, "width": 256})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["seed"].as_u64().unwrap() < ultraflux_core::RANDOM_SEED_BOUND);
    }

    #[tokio::test]
    async fn out_of_range_requests_are_rejected_before_generation() {
        let h = harness(true);
        let cases = [
            json!({"prompt": "x", "height": 128}),
            json!({"prompt": "x", "width": 5000}),
            json!({"prompt": "x", "num_inference_steps": 5}),
            json!({"prompt": "x", "guidance_scale": 25.0}),
            json!({"prompt": ""}),
            json!({"height": 512}),
            json!({"prompt": "x", "seed": -1}),
        ];
        for case in cases {
            let (status, body) = send(router(h.service.clone()), generate_req(case.clone())).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{case}");
            assert!(body["detail"].is_string(), "{case}");
        }
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn only_retryable_errors_map_to_service_unavailable() {
        let oom = ServiceError::from_generation(anyhow::anyhow!("CUDA_ERROR_OUT_OF_MEMORY"));
        assert!(oom.is_retryable());
        assert_eq!(ApiError::from(oom).0, StatusCode::SERVICE_UNAVAILABLE);

        let failed = ServiceError::from_generation(anyhow::anyhow!("bad shape"));
        assert!(!failed.is_retryable());
        assert_eq!(ApiError::from(failed).0, StatusCode::INTERNAL_SERVER_ERROR);

        let invalid = ServiceError::from(ultraflux_core::ValidationError::Steps(3));
        assert_eq!(ApiError::from(invalid).0, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn failures_map_to_status_codes_and_do_not_stick() {
        let h = harness(true);
        let small = |prompt: &str| json!({"prompt": prompt, "height": 256, "width": 256});

        let (status, body) = send(router(h.service.clone()), generate_req(small("oom"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["detail"].as_str().unwrap().contains("out of memory"));

        let (status, body) = send(router(h.service.clone()), generate_req(small("boom"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "unexpected tensor shape");

        let (status, _) = send(router(h.service.clone()), generate_req(small("a cat"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.runs.load(Ordering::SeqCst), 3);
    }
}
