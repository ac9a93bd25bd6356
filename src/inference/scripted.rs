use std::collections::HashMap;

use async_trait::async_trait;
use ndarray::ArrayD;
use parking_lot::Mutex;

use super::{InferenceError, InferencePort};

type Responder = Box<dyn Fn(&ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> + Send + Sync>;

/// Deterministic in-memory port: every model name maps to a closure that
/// computes the output from the input. Calls are recorded in order.
#[derive(Default)]
pub struct ScriptedInference {
    responders: HashMap<String, Responder>,
    calls: Mutex<Vec<(String, Vec<usize>)>>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond<F>(mut self, model: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> + Send + Sync + 'static,
    {
        self.responders.insert(model.into(), Box::new(responder));
        self
    }

    /// `(model, input shape)` for every call so far.
    pub fn calls(&self) -> Vec<(String, Vec<usize>)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, model: &str) -> usize {
        self.calls.lock().iter().filter(|(name, _)| name == model).count()
    }
}

#[async_trait]
impl InferencePort for ScriptedInference {
    async fn infer(&self, model: &str, input: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        self.calls
            .lock()
            .push((model.to_string(), input.shape().to_vec()));
        let responder = self
            .responders
            .get(model)
            .ok_or_else(|| InferenceError::UnknownModel(model.to_string()))?;
        responder(&input)
    }
}
