use std::time::Instant;

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    Json,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    errors::ApiError,
    types::{HealthResponse, PredictResponse, RateRequest, SimpleResponse, TranscribeRequest},
    AppState,
};
use crate::{store::PredictionRecord, Detection, Error};

struct PredictForm {
    user_id: String,
    request_id: String,
    file: Vec<u8>,
}

fn invalid_form(error: MultipartError) -> ApiError {
    ApiError::InvalidRequest(error.body_text())
}

async fn read_predict_form(mut multipart: Multipart) -> Result<PredictForm, ApiError> {
    let mut user_id = None;
    let mut request_id = None;
    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(invalid_form)? {
        match field.name() {
            Some("user_id") => user_id = Some(field.text().await.map_err(invalid_form)?),
            Some("request_id") => request_id = Some(field.text().await.map_err(invalid_form)?),
            Some("file") => file = Some(field.bytes().await.map_err(invalid_form)?),
            _ => {}
        }
    }

    let user_id = user_id.ok_or_else(|| ApiError::ValidationError {
        field: "user_id".to_string(),
        message: "field is required".to_string(),
    })?;
    let file = file.ok_or_else(|| ApiError::ValidationError {
        field: "file".to_string(),
        message: "field is required".to_string(),
    })?;
    let request_id = request_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    Ok(PredictForm {
        user_id,
        request_id,
        file: file.to_vec(),
    })
}

/// POST /predict - recognize the handwriting in an uploaded image
///
/// Multipart fields: `user_id`, `file`, and an optional `request_id`
/// (generated when absent). The result is stored before it is returned.
pub async fn predict(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let form = read_predict_form(multipart).await?;
    debug!("Predict request {} from user {}", form.request_id, form.user_id);

    let image = image::load_from_memory(&form.file).map_err(Error::InvalidImage)?;

    let started = Instant::now();
    let transcription = state.ocr.recognize(&image).await?;
    let processing_time = started.elapsed().as_secs_f64();

    let detections = transcription.boxes.iter().map(Detection::from).collect();
    let record = PredictionRecord::new(
        form.user_id,
        form.request_id.clone(),
        processing_time,
        detections,
    );
    state.store.insert(record).await?;

    info!(
        "Prediction {}: {} boxes, confidence {:.3}, {:.3}s",
        form.request_id,
        transcription.boxes.len(),
        transcription.confidence,
        processing_time
    );
    Ok(Json(PredictResponse {
        request_id: form.request_id,
        prediction: transcription.text,
        confidence: transcription.confidence,
        status: "ok".to_string(),
    }))
}

/// POST /rate - attach a 1 to 5 rating to a prediction
pub async fn rate(
    State(state): State<AppState>,
    Json(request): Json<RateRequest>,
) -> Result<Json<SimpleResponse>, ApiError> {
    let rating = u8::try_from(request.rating)
        .ok()
        .filter(|rating| (1..=5).contains(rating))
        .ok_or_else(|| ApiError::ValidationError {
            field: "rating".to_string(),
            message: "Rating must be between 1 and 5".to_string(),
        })?;
    if !state.store.update_rating(&request.request_id, rating).await? {
        return Err(Error::NotFound(request.request_id).into());
    }
    Ok(Json(SimpleResponse::ok("Rating updated successfully")))
}

/// POST /transcribe - attach the user's corrected text to a prediction
pub async fn transcribe(
    State(state): State<AppState>,
    Json(request): Json<TranscribeRequest>,
) -> Result<Json<SimpleResponse>, ApiError> {
    if request.transcription.is_empty() {
        return Err(ApiError::ValidationError {
            field: "transcription".to_string(),
            message: "Transcription must not be empty".to_string(),
        });
    }
    if !state
        .store
        .update_transcription(&request.request_id, &request.transcription)
        .await?
    {
        return Err(Error::NotFound(request.request_id).into());
    }
    Ok(Json(SimpleResponse::ok("Transcription updated successfully")))
}

pub async fn get_prediction(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<PredictionRecord>, ApiError> {
    state
        .store
        .get_by_request_id(&request_id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::NotFound(request_id).into())
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}
