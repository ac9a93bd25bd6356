//! Model-serving boundary.
//!
//! The pipeline only ever talks to an [`InferencePort`]: given a model name and
//! an input tensor it returns the output tensor. [`onnx`] runs models in process
//! through ONNX Runtime, [`remote`] forwards to a model server over HTTP and
//! [`scripted`] answers from closures for tests and demos.

use async_trait::async_trait;
use ndarray::ArrayD;
use thiserror::Error;

pub mod onnx;
pub mod remote;
pub mod scripted;

pub use onnx::{ExecutionProvider, OnnxInference, OnnxInferenceBuilder};
pub use remote::{RemoteInference, RemoteModel};
pub use scripted::ScriptedInference;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model '{0}' is not served by this backend")]
    UnknownModel(String),
    #[error("model server unreachable: {0}")]
    Unavailable(String),
    #[error("inference timed out")]
    Timeout,
    #[error("model server returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<ort::Error> for InferenceError {
    fn from(error: ort::Error) -> Self {
        Self::Runtime(error.to_string())
    }
}

#[async_trait]
pub trait InferencePort: Send + Sync {
    async fn infer(&self, model: &str, input: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError>;
}
