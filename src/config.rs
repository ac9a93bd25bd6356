use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    crop::CropOptions,
    detection::DetectionOptions,
    inference::{InferencePort, OnnxInferenceBuilder, RemoteInference, RemoteModel},
    recognition::RecognitionOptions,
    store::{MemoryStore, PredictionStore, SqliteStore},
    Error, Result,
};

pub const DETECTION_MODEL: &str = "detection";
pub const RECOGNITION_MODEL: &str = "recognition";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub detection: DetectionConfig,
    pub recognition: RecognitionConfig,
    pub storage: StorageConfig,
}

impl ServiceConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let recognition = &self.recognition;
        if !(0.0..=1.0).contains(&recognition.low_confidence)
            || !(0.0..=1.0).contains(&recognition.acceptance)
        {
            return Err(Error::Config(
                "recognition thresholds must lie in [0, 1]".to_string(),
            ));
        }
        if recognition.model_height == 0 || recognition.max_width < recognition.model_height {
            return Err(Error::Config(
                "recognition.max_width must be at least recognition.model_height".to_string(),
            ));
        }
        if self.detection.canvas_size < 32 {
            return Err(Error::Config(
                "detection.canvas_size must be at least 32".to_string(),
            ));
        }
        if self.inference.backend == InferenceBackend::Remote && self.inference.remote_url.is_none()
        {
            return Err(Error::Config(
                "inference.remote_url is required for the remote backend".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_concurrent_requests: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Onnx,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// ONNX file, relative paths resolve against the models directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_input")]
    pub input: String,
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_input() -> String {
    "input".to_string()
}

fn default_output() -> String {
    "output".to_string()
}

impl ModelConfig {
    fn named(file: &str) -> Self {
        Self {
            path: Some(PathBuf::from(file)),
            input: default_input(),
            output: default_output(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
    pub remote_url: Option<String>,
    pub timeout_secs: u64,
    pub threads: usize,
    pub models_dir: PathBuf,
    pub models: HashMap<String, ModelConfig>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::Onnx,
            remote_url: None,
            timeout_secs: 30,
            threads: 4,
            models_dir: PathBuf::from("models"),
            models: HashMap::from([
                (DETECTION_MODEL.to_string(), ModelConfig::named("detection.onnx")),
                (RECOGNITION_MODEL.to_string(), ModelConfig::named("recognition.onnx")),
            ]),
        }
    }
}

impl InferenceConfig {
    /// Builds the configured backend. ONNX sessions are created eagerly.
    pub fn connect(&self) -> Result<Arc<dyn InferencePort>> {
        match self.backend {
            InferenceBackend::Onnx => {
                let mut builder = OnnxInferenceBuilder::new().threads(self.threads);
                for (name, model) in &self.models {
                    let path = model.path.as_ref().ok_or_else(|| {
                        Error::Config(format!("model '{name}' needs a path for the onnx backend"))
                    })?;
                    builder = builder.model(name.clone(), self.models_dir.join(path));
                }
                let inference = builder.build().map_err(crate::inference::InferenceError::from)?;
                Ok(Arc::new(inference))
            }
            InferenceBackend::Remote => {
                let url = self.remote_url.clone().ok_or_else(|| {
                    Error::Config("inference.remote_url is required".to_string())
                })?;
                let models = self
                    .models
                    .iter()
                    .map(|(name, model)| {
                        (
                            name.clone(),
                            RemoteModel {
                                input: model.input.clone(),
                                output: model.output.clone(),
                            },
                        )
                    })
                    .collect();
                let inference =
                    RemoteInference::new(url, Duration::from_secs(self.timeout_secs), models)?;
                Ok(Arc::new(inference))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub canvas_size: u32,
    pub mag_ratio: f32,
    pub text_threshold: f32,
    pub link_threshold: f32,
    pub low_text: f32,
    pub min_component_area: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let options = DetectionOptions::default();
        Self {
            canvas_size: options.canvas_size,
            mag_ratio: options.mag_ratio,
            text_threshold: options.text_threshold,
            link_threshold: options.link_threshold,
            low_text: options.low_text,
            min_component_area: options.min_component_area,
        }
    }
}

impl From<&DetectionConfig> for DetectionOptions {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            canvas_size: config.canvas_size,
            mag_ratio: config.mag_ratio,
            text_threshold: config.text_threshold,
            link_threshold: config.link_threshold,
            low_text: config.low_text,
            min_component_area: config.min_component_area,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub model_height: u32,
    pub max_width: u32,
    pub low_confidence: f32,
    pub acceptance: f32,
    pub apply_softmax: bool,
    pub second_pass_model: String,
    pub second_pass_contrast: Option<f32>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        let options = RecognitionOptions::default();
        Self {
            model_height: options.crop.model_height,
            max_width: options.crop.max_width,
            low_confidence: options.low_confidence,
            acceptance: options.acceptance,
            apply_softmax: true,
            second_pass_model: RECOGNITION_MODEL.to_string(),
            second_pass_contrast: options.second_pass_contrast,
        }
    }
}

impl From<&RecognitionConfig> for RecognitionOptions {
    fn from(config: &RecognitionConfig) -> Self {
        Self {
            crop: CropOptions {
                model_height: config.model_height,
                max_width: config.max_width,
            },
            low_confidence: config.low_confidence,
            acceptance: config.acceptance,
            second_pass_contrast: config.second_pass_contrast,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("predictions.db"),
        }
    }
}

impl StorageConfig {
    pub fn open(&self) -> Result<Arc<dyn PredictionStore>> {
        Ok(match self.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Sqlite => Arc::new(SqliteStore::open(&self.path)?),
        })
    }
}
