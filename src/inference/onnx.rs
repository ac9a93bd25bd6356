use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use ndarray::ArrayD;
use ort::{inputs, ExecutionProviderDispatch, GraphOptimizationLevel, Session};
use tracing::instrument;

use super::{InferenceError, InferencePort};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

pub const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];

#[cfg(feature = "coreml")]
fn setup_coreml() -> ExecutionProviderDispatch {
    use ort::CoreMLExecutionProvider;

    CoreMLExecutionProvider::default().build()
}

#[cfg(feature = "cuda")]
fn setup_cuda() -> ExecutionProviderDispatch {
    use ort::CUDAExecutionProvider;

    CUDAExecutionProvider::default().build()
}

#[cfg(feature = "directml")]
fn setup_directml() -> ExecutionProviderDispatch {
    use ort::DirectMLExecutionProvider;

    DirectMLExecutionProvider::default().build()
}

struct OnnxModel {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxModel {
    #[instrument(level = "debug")]
    fn init(
        path: PathBuf,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
    ) -> ort::Result<Self> {
        #[cfg(feature = "directml")]
        let parallel = !execution_providers.contains(&ExecutionProvider::DirectML);
        #[cfg(not(feature = "directml"))]
        let parallel = true;

        let execution_providers = execution_providers.iter().filter_map(
            |provider| -> Option<ExecutionProviderDispatch> {
                match provider {
                    ExecutionProvider::Default => None,
                    #[cfg(feature = "coreml")]
                    ExecutionProvider::CoreML => Some(setup_coreml()),
                    #[cfg(feature = "cuda")]
                    ExecutionProvider::Cuda => Some(setup_cuda()),
                    #[cfg(feature = "directml")]
                    ExecutionProvider::DirectML => Some(setup_directml()),
                }
            },
        );

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_memory_pattern(parallel)?
            .with_parallel_execution(parallel)?
            .with_inter_threads(num_threads)?
            .with_intra_threads(num_threads)?
            .with_execution_providers(execution_providers)?
            .commit_from_file(path)?;

        log::debug!("Session inputs: {:?}", session.inputs);
        log::debug!("Session outputs: {:?}", session.outputs);

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "input".to_string());
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .unwrap_or_else(|| "output".to_string());

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }

    fn run(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => input]?)?;
        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            InferenceError::InvalidResponse(format!("missing output '{}'", self.output_name))
        })?;
        let tensor = output.try_extract_tensor::<f32>()?;
        log::trace!("Output tensor size: {:?}", tensor.shape());
        Ok(tensor.to_owned())
    }
}

/// Named ONNX models run in process. Sessions are shared across requests;
/// every call runs on the blocking thread pool.
pub struct OnnxInference {
    models: HashMap<String, Arc<OnnxModel>>,
}

#[async_trait]
impl InferencePort for OnnxInference {
    #[instrument(level = "debug", skip(self, input))]
    async fn infer(&self, model: &str, input: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        let session = self
            .models
            .get(model)
            .cloned()
            .ok_or_else(|| InferenceError::UnknownModel(model.to_string()))?;
        tokio::task::spawn_blocking(move || session.run(input))
            .await
            .map_err(|e| InferenceError::Runtime(e.to_string()))?
    }
}

pub struct OnnxInferenceBuilder {
    threads: usize,
    models: Vec<(String, PathBuf)>,
    execution_providers: Vec<ExecutionProvider>,
}

impl OnnxInferenceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn model(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.models.push((name.into(), path.into()));
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    #[instrument(skip(self))]
    pub fn build(self) -> ort::Result<OnnxInference> {
        let models = self
            .models
            .into_iter()
            .map(|(name, path)| {
                let model = OnnxModel::init(path, self.threads, &self.execution_providers)?;
                Ok((name, Arc::new(model)))
            })
            .collect::<ort::Result<HashMap<_, _>>>()?;
        Ok(OnnxInference { models })
    }
}

impl Default for OnnxInferenceBuilder {
    fn default() -> Self {
        Self {
            threads: 4,
            models: Vec::new(),
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
        }
    }
}
