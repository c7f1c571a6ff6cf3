// HTTP surface: routing, CORS, multipart parsing and error responses

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::core::config::Config;
use crate::core::errors::{ErrorClass, InfuseError};
use crate::core::types::{ErrorBody, InfuseRequest, SampleResult};
use crate::orchestration::InfuseOrchestrator;
use crate::utils::Metrics;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<InfuseOrchestrator>,
    pub metrics: Metrics,
}

/// Build the application router with monitoring endpoints
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(state.config.server.cors_allowed_origin.as_deref());
    let body_limit = state.config.server.max_upload_mb * 1024 * 1024;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/api/infuse", post(infuse))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let allow_origin = match origin.map(HeaderValue::from_str) {
        Some(Ok(value)) => AllowOrigin::exact(value),
        Some(Err(e)) => {
            warn!("Ignoring invalid CORS_ALLOWED_ORIGIN ({}), allowing any origin", e);
            AllowOrigin::from(Any)
        }
        None => AllowOrigin::from(Any),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Request failure rendered as `{"error": ...}`
pub struct ApiError(pub InfuseError);

impl From<InfuseError> for ApiError {
    fn from(err: InfuseError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match (&self.0, self.0.class()) {
            // Client went away; nginx's convention
            (InfuseError::Cancelled, _) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            (InfuseError::SamplerExhausted(_), _) => StatusCode::SERVICE_UNAVAILABLE,
            (_, ErrorClass::Client) => StatusCode::BAD_REQUEST,
            (_, ErrorClass::Server) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.0.public_message(),
        });

        if self.0.retryable() {
            (status, [(header::RETRY_AFTER, "10")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

async fn root() -> &'static str {
    "Infuse compositing server"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "sampler": state.orchestrator.sampler_name(),
        "sampler_busy": state.orchestrator.sampler_busy(),
        "canvas_size": state.orchestrator.canvas_size(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    serde_json::to_value(state.metrics.snapshot())
        .map(Json)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialize metrics: {}", e),
            )
        })
}

/// Compositing endpoint
///
/// # Request Format:
/// - multipart/form-data
/// - Files: "background_image", "front_image", "removed_bg_image"
/// - Text: "transform" (JSON `{x, y, rotation, scale}`), "batch_count",
///   optional "step_count" (also accepted as "steps")
///
/// # Response:
/// - JSON array of `{id, imageUrl}` in sample order, or `{error}`
async fn infuse(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Vec<SampleResult>>, ApiError> {
    let multipart = multipart
        .map_err(|e| InfuseError::MalformedRequest(format!("expected multipart form: {}", e)))?;
    let request = read_form(multipart).await?;

    info!("Received infuse request");
    let results = state.orchestrator.process(request).await?;
    Ok(Json(results))
}

async fn read_form(mut multipart: Multipart) -> Result<InfuseRequest, InfuseError> {
    let mut request = InfuseRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| InfuseError::MalformedRequest(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        let read_err = |e: axum::extract::multipart::MultipartError| {
            InfuseError::MalformedRequest(format!("Failed to read field '{}': {}", name, e))
        };

        match name.as_str() {
            "background_image" => {
                request.background_image = Some(field.bytes().await.map_err(read_err)?)
            }
            "front_image" => request.front_image = Some(field.bytes().await.map_err(read_err)?),
            "removed_bg_image" => {
                request.removed_bg_image = Some(field.bytes().await.map_err(read_err)?)
            }
            "transform" => request.transform = Some(field.text().await.map_err(read_err)?),
            "batch_count" => request.batch_count = Some(field.text().await.map_err(read_err)?),
            "step_count" | "steps" => {
                request.step_count = Some(field.text().await.map_err(read_err)?)
            }
            _ => {}
        }
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sampler::{PlaceholderSampler, SeedPolicy};
    use crate::utils::image_ops::encode_png;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use image::{DynamicImage, Rgb, RgbImage};
    use tower::ServiceExt;

    const BOUNDARY: &str = "infuse-test-boundary";

    fn app(stub: Arc<PlaceholderSampler>) -> Router {
        let config = Arc::new(Config::default());
        let metrics = Metrics::new();
        let orchestrator = Arc::new(InfuseOrchestrator::new(
            Arc::clone(&config),
            stub,
            Arc::new(SeedPolicy::Fixed(100)),
            metrics.clone(),
        ));
        router(AppState {
            config,
            orchestrator,
            metrics,
        })
    }

    fn png(colour: [u8; 3]) -> Vec<u8> {
        encode_png(&DynamicImage::ImageRgb8(RgbImage::from_pixel(24, 24, Rgb(colour)))).unwrap()
    }

    fn multipart_body(text: &[(&str, &str)], files: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in text {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        for (name, bytes) in files {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}.png\"\r\nContent-Type: image/png\r\n\r\n",
                    BOUNDARY, name, name
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn infuse_request(text: &[(&str, &str)]) -> Request<Body> {
        let files = [
            ("background_image", png([10, 120, 200])),
            ("front_image", png([200, 40, 40])),
            ("removed_bg_image", png([255, 255, 255])),
        ];
        Request::post("/api/infuse")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(text, &files)))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const TRANSFORM: &str = r#"{"x":20,"y":-10,"rotation":30,"scale":0.8}"#;

    #[tokio::test]
    async fn test_infuse_success() {
        let stub = Arc::new(PlaceholderSampler::new());
        let response = app(Arc::clone(&stub))
            .oneshot(infuse_request(&[("transform", TRANSFORM), ("batch_count", "2")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let results = body.as_array().unwrap();
        assert_eq!(results.len(), 2);
        for result in results {
            assert!(result["id"].as_str().unwrap().starts_with("result-"));
            assert!(result["imageUrl"]
                .as_str()
                .unwrap()
                .starts_with("data:image/png;base64,"));
        }
    }

    #[tokio::test]
    async fn test_steps_alias() {
        let stub = Arc::new(PlaceholderSampler::new());
        let response = app(Arc::clone(&stub))
            .oneshot(infuse_request(&[
                ("transform", TRANSFORM),
                ("batch_count", "1"),
                ("steps", "7"),
            ]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(stub.last_params().unwrap().step_count, 7);
    }

    #[tokio::test]
    async fn test_invalid_transform_is_bad_request() {
        let stub = Arc::new(PlaceholderSampler::new());
        let response = app(Arc::clone(&stub))
            .oneshot(infuse_request(&[("transform", "{not json"), ("batch_count", "1")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid transform"));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_is_service_unavailable() {
        let stub = Arc::new(PlaceholderSampler::new());
        stub.fail_next_with_exhaustion();
        let response = app(Arc::clone(&stub))
            .oneshot(infuse_request(&[("transform", TRANSFORM), ("batch_count", "1")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        let body = json_body(response).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_non_multipart_is_bad_request() {
        let response = app(Arc::new(PlaceholderSampler::new()))
            .oneshot(
                Request::post("/api/infuse")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("multipart"));
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let router = app(Arc::new(PlaceholderSampler::new()));

        let response = router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["sampler"], "placeholder");
        assert_eq!(body["canvas_size"], 512);

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("infuse_requests_total 0"));
    }

    #[test]
    fn test_status_mapping() {
        let status = |e: InfuseError| ApiError(e).status();
        assert_eq!(status(InfuseError::InvalidTransform("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(InfuseError::DegenerateBoundingBox { x1: 0, y1: 0, x2: 0, y2: 4 }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(InfuseError::SamplerExhausted("oom".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(InfuseError::Internal("bug".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status(InfuseError::Cancelled).as_u16(), 499);
    }
}
