use thiserror::Error;

use crate::{ctc::DecodeError, inference::InferenceError, store::StoreError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("inference unavailable: {0}")]
    InferenceUnavailable(#[from] InferenceError),
    #[error("prediction with request_id {0} not found")]
    NotFound(String),
    #[error("model output violates the decoding contract: {0}")]
    DecodeContractViolation(#[from] DecodeError),
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("pipeline worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
