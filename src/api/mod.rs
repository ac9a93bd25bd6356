//! HTTP surface of the recognition service.
//!
//! | Route | |
//! |---|---|
//! | `POST /predict` | multipart upload, returns the transcription |
//! | `POST /rate` | 1 to 5 rating for a prediction |
//! | `POST /transcribe` | corrected text for a prediction |
//! | `GET /predictions/:request_id` | stored record |
//! | `GET /health` | liveness |

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{config::ServerConfig, store::PredictionStore, HandwritingOcr};

pub mod errors;
pub mod handlers;
pub mod types;

pub use errors::{ApiError, ErrorResponse};
pub use types::*;

/// Uploads larger than this are rejected before the handler runs.
pub const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub ocr: Arc<HandwritingOcr>,
    pub store: Arc<dyn PredictionStore>,
}

impl AppState {
    pub fn new(ocr: Arc<HandwritingOcr>, store: Arc<dyn PredictionStore>) -> Self {
        Self { ocr, store }
    }
}

pub fn router(state: AppState, max_concurrent_requests: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/predict", post(handlers::predict))
        .route("/rate", post(handlers::rate))
        .route("/transcribe", post(handlers::transcribe))
        .route("/predictions/:request_id", get(handlers::get_prediction))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(max_concurrent_requests.max(1)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until Ctrl+C.
pub async fn serve(state: AppState, config: &ServerConfig) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state, config.max_concurrent_requests))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutting down");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ctc::Vocabulary,
        inference::{InferenceError, ScriptedInference},
        store::{MemoryStore, PredictionRecord},
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use ndarray::{s, Array3, Array4};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    const BOUNDARY: &str = "handscript-test-boundary";

    fn scripted_port() -> ScriptedInference {
        ScriptedInference::new()
            .respond("detection", |input| {
                let (height, width) = (input.shape()[2] / 2, input.shape()[3] / 2);
                let mut output = Array4::<f32>::zeros((1, height, width, 2));
                output.slice_mut(s![0, 5..15, 5..35, 0]).fill(0.9);
                Ok(output.into_dyn())
            })
            .respond("recognition", |_| {
                let classes = Vocabulary::default().len();
                let mut output = Array3::from_elem((1, 1, classes), 0.05 / (classes - 1) as f32);
                output[[0, 0, 12]] = 0.95;
                Ok(output.into_dyn())
            })
    }

    fn state_with(port: ScriptedInference) -> (AppState, Arc<MemoryStore>) {
        let ocr = HandwritingOcr::builder()
            .inference(Arc::new(port))
            .apply_softmax(false)
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        (AppState::new(Arc::new(ocr), store.clone()), store)
    }

    fn png() -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 32, Rgb([255, 255, 255])));
        let mut bytes = std::io::Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    fn predict_request(request_id: Option<&str>, file: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        let mut text_field = |name: &str, value: &str| {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        };
        text_field("user_id", "user-7");
        if let Some(request_id) = request_id {
            text_field("request_id", request_id);
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"photo.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, json: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send<T: DeserializeOwned>(app: &Router, request: Request<Body>) -> (StatusCode, T) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (state, _) = state_with(scripted_port());
        let app = router(state, 4);
        let (status, body): (_, HealthResponse) = send(&app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn predict_recognizes_and_persists() {
        let (state, store) = state_with(scripted_port());
        let app = router(state, 4);

        let (status, body): (_, PredictResponse) =
            send(&app, predict_request(Some("req-1"), &png())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.request_id, "req-1");
        assert_eq!(body.prediction, "A");
        assert_eq!(body.status, "ok");
        assert!((body.confidence - 0.9025).abs() < 1e-4);

        let (status, record): (_, PredictionRecord) =
            send(&app, get_request("/predictions/req-1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record.user_id, "user-7");
        assert_eq!(record.detections.len(), 1);
        assert_eq!(record.detections[0].text, "A");
        assert_eq!(record.detections[0].bbox.len(), 8);
        assert_eq!(record.user_rating, None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn predict_generates_a_request_id() {
        let (state, _) = state_with(scripted_port());
        let app = router(state, 4);
        let (status, body): (_, PredictResponse) =
            send(&app, predict_request(None, &png())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(uuid::Uuid::parse_str(&body.request_id).is_ok());
    }

    #[tokio::test]
    async fn predict_rejects_undecodable_images() {
        let (state, store) = state_with(scripted_port());
        let app = router(state, 4);
        let (status, body): (_, ErrorResponse) =
            send(&app, predict_request(Some("req-1"), b"not an image")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error_type, "invalid_request");
        assert!(body.message.starts_with("Invalid image: "), "{}", body.message);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn inference_outage_persists_nothing() {
        let port = ScriptedInference::new().respond("detection", |_| {
            Err(InferenceError::Unavailable("connection refused".to_string()))
        });
        let (state, store) = state_with(port);
        let app = router(state, 4);
        let (status, body): (_, ErrorResponse) =
            send(&app, predict_request(Some("req-1"), &png())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.error_type, "service_unavailable");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn rating_round_trip() {
        let (state, _) = state_with(scripted_port());
        let app = router(state, 4);
        let _: (_, PredictResponse) = send(&app, predict_request(Some("req-1"), &png())).await;

        let (status, body): (_, SimpleResponse) = send(
            &app,
            json_request("/rate", serde_json::json!({"request_id": "req-1", "rating": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);

        let (_, record): (_, PredictionRecord) =
            send(&app, get_request("/predictions/req-1")).await;
        assert_eq!(record.user_rating, Some(4));
    }

    #[tokio::test]
    async fn rating_outside_range_is_rejected() {
        let (state, _) = state_with(scripted_port());
        let app = router(state, 4);
        let _: (_, PredictResponse) = send(&app, predict_request(Some("req-1"), &png())).await;
        for rating in [0, 6, -1] {
            let (status, body): (_, ErrorResponse) = send(
                &app,
                json_request(
                    "/rate",
                    serde_json::json!({"request_id": "req-1", "rating": rating}),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
            assert_eq!(body.error_type, "validation_error");
        }
    }

    #[tokio::test]
    async fn unknown_request_ids_are_not_found() {
        let (state, store) = state_with(scripted_port());
        let app = router(state, 4);

        let (status, body): (_, ErrorResponse) = send(
            &app,
            json_request("/rate", serde_json::json!({"request_id": "nope", "rating": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.message, "Prediction with request_id nope not found");

        let (status, body): (_, ErrorResponse) = send(
            &app,
            json_request(
                "/transcribe",
                serde_json::json!({"request_id": "nope", "transcription": "text"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.message, "Prediction with request_id nope not found");

        let (status, body): (_, ErrorResponse) =
            send(&app, get_request("/predictions/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error_type, "not_found");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn transcription_round_trip() {
        let (state, _) = state_with(scripted_port());
        let app = router(state, 4);
        let _: (_, PredictResponse) = send(&app, predict_request(Some("req-1"), &png())).await;

        let (status, _): (_, ErrorResponse) = send(
            &app,
            json_request(
                "/transcribe",
                serde_json::json!({"request_id": "req-1", "transcription": ""}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body): (_, SimpleResponse) = send(
            &app,
            json_request(
                "/transcribe",
                serde_json::json!({"request_id": "req-1", "transcription": "Привет"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.message, "Transcription updated successfully");

        let (_, record): (_, PredictionRecord) =
            send(&app, get_request("/predictions/req-1")).await;
        assert_eq!(record.user_transcription.as_deref(), Some("Привет"));
    }

    #[tokio::test]
    async fn duplicate_request_ids_conflict() {
        let (state, store) = state_with(scripted_port());
        let app = router(state, 4);
        let _: (_, PredictResponse) = send(&app, predict_request(Some("req-1"), &png())).await;
        let (status, _): (_, ErrorResponse) =
            send(&app, predict_request(Some("req-1"), &png())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(store.len(), 1);
    }
}
