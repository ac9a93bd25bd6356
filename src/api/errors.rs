use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{store::StoreError, Error};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    NotFound(String),
    InvalidRequest(String),
    ValidationError { field: String, message: String },
    Conflict(String),
    ServiceUnavailable(String),
    InternalError(String),
}

impl ApiError {
    /// Unknown request id on a feedback endpoint.
    pub fn prediction_not_found(request_id: &str) -> Self {
        Self::NotFound(format!("Prediction with request_id {request_id} not found"))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_response(&self, request_id: Option<String>) -> ErrorResponse {
        let (error_type, message) = match self {
            ApiError::NotFound(msg) => ("not_found", msg.clone()),
            ApiError::InvalidRequest(msg) => ("invalid_request", msg.clone()),
            ApiError::ValidationError { field, message } => {
                ("validation_error", format!("{field}: {message}"))
            }
            ApiError::Conflict(msg) => ("conflict", msg.clone()),
            ApiError::ServiceUnavailable(msg) => ("service_unavailable", msg.clone()),
            ApiError::InternalError(msg) => ("internal_error", msg.clone()),
        };
        ErrorResponse {
            error_type: error_type.to_string(),
            message,
            request_id,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_response(None).message)
    }
}

impl std::error::Error for ApiError {}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        match error {
            Error::InferenceUnavailable(e) => ApiError::ServiceUnavailable(e.to_string()),
            Error::NotFound(request_id) => ApiError::prediction_not_found(&request_id),
            Error::InvalidImage(e) => ApiError::InvalidRequest(format!("Invalid image: {e}")),
            Error::PersistenceFailure(StoreError::Duplicate(request_id)) => ApiError::Conflict(
                format!("Prediction with request_id {request_id} already exists"),
            ),
            other => ApiError::InternalError(format!("Internal server error: {other}")),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Error::from(error).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::warn!("Request failed: {self}");
        } else {
            log::debug!("Request rejected: {self}");
        }
        (status, Json(self.to_response(None))).into_response()
    }
}
