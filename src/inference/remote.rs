use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{InferenceError, InferencePort};

/// Tensor names a remote model expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteModel {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorPayload {
    name: String,
    shape: Vec<usize>,
    datatype: String,
    data: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct InferRequest {
    inputs: Vec<TensorPayload>,
    outputs: Vec<OutputSelector>,
}

#[derive(Debug, Serialize)]
struct OutputSelector {
    name: String,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    outputs: Vec<TensorPayload>,
}

/// Client for a model server speaking the KServe v2 HTTP/JSON inference
/// protocol (`POST {base}/v2/models/{name}/infer`).
pub struct RemoteInference {
    client: reqwest::Client,
    base_url: String,
    models: HashMap<String, RemoteModel>,
}

impl RemoteInference {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        models: HashMap<String, RemoteModel>,
    ) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            models,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v2/models/{model}/infer", self.base_url)
    }
}

fn request_error(error: reqwest::Error) -> InferenceError {
    if error.is_timeout() {
        InferenceError::Timeout
    } else if error.is_decode() {
        InferenceError::InvalidResponse(error.to_string())
    } else {
        InferenceError::Unavailable(error.to_string())
    }
}

fn into_array(payload: TensorPayload) -> Result<ArrayD<f32>, InferenceError> {
    ArrayD::from_shape_vec(IxDyn(&payload.shape), payload.data).map_err(|e| {
        InferenceError::InvalidResponse(format!("output '{}': {e}", payload.name))
    })
}

#[async_trait]
impl InferencePort for RemoteInference {
    #[instrument(level = "debug", skip(self, input))]
    async fn infer(&self, model: &str, input: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        let served = self
            .models
            .get(model)
            .ok_or_else(|| InferenceError::UnknownModel(model.to_string()))?;

        let shape = input.shape().to_vec();
        let data = input.iter().copied().collect::<Vec<f32>>();
        let body = InferRequest {
            inputs: vec![TensorPayload {
                name: served.input.clone(),
                shape,
                datatype: "FP32".to_string(),
                data,
            }],
            outputs: vec![OutputSelector {
                name: served.output.clone(),
            }],
        };

        let response = self
            .client
            .post(self.endpoint(model))
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(InferenceError::Unavailable(format!(
                "model '{model}' answered {status}: {detail}"
            )));
        }

        let response: InferResponse = response.json().await.map_err(request_error)?;
        let output = response
            .outputs
            .into_iter()
            .find(|it| it.name == served.output)
            .ok_or_else(|| {
                InferenceError::InvalidResponse(format!("missing output '{}'", served.output))
            })?;
        log::trace!("Output tensor size: {:?}", output.shape);
        into_array(output)
    }
}
