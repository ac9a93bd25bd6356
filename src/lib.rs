use std::sync::Arc;

use image::DynamicImage;
use tracing::instrument;

pub mod api;
pub mod config;
pub mod conversation;
pub mod crop;
pub mod ctc;
pub mod detection;
mod error;
pub mod evaluation;
pub mod inference;
pub mod recognition;
mod result;
pub mod store;
pub mod util;

pub use error::{Error, Result};
pub use result::*;

pub use ort as runtime;

use config::{ServiceConfig, DETECTION_MODEL, RECOGNITION_MODEL};
use ctc::{CtcDecoder, Vocabulary};
use detection::{DetectionOptions, Detector};
use inference::InferencePort;
use recognition::{RecognitionOptions, Recognizer};

pub struct HandwritingOcrBuilder {
    inference: Option<Arc<dyn InferencePort>>,
    detection_model: String,
    recognition_model: String,
    second_pass_model: Option<String>,
    detection: DetectionOptions,
    recognition: RecognitionOptions,
    vocabulary: Vocabulary,
    apply_softmax: bool,
}

impl HandwritingOcrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inference(mut self, inference: Arc<dyn InferencePort>) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn detection_model(mut self, name: impl Into<String>) -> Self {
        self.detection_model = name.into();
        self
    }

    pub fn recognition_model(mut self, name: impl Into<String>) -> Self {
        self.recognition_model = name.into();
        self
    }

    /// Model for low-confidence retries. Defaults to the recognition model.
    pub fn second_pass_model(mut self, name: impl Into<String>) -> Self {
        self.second_pass_model = Some(name.into());
        self
    }

    pub fn detection_options(mut self, options: DetectionOptions) -> Self {
        self.detection = options;
        self
    }

    pub fn recognition_options(mut self, options: RecognitionOptions) -> Self {
        self.recognition = options;
        self
    }

    pub fn vocabulary(mut self, vocabulary: Vocabulary) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    /// Whether recognizer outputs are logits that need a softmax.
    pub fn apply_softmax(mut self, apply_softmax: bool) -> Self {
        self.apply_softmax = apply_softmax;
        self
    }

    #[instrument(skip(self))]
    pub fn build(self) -> Result<HandwritingOcr> {
        let inference = self
            .inference
            .ok_or_else(|| Error::Config("no inference backend configured".to_string()))?;
        let second_pass_model = self
            .second_pass_model
            .unwrap_or_else(|| self.recognition_model.clone());
        let decoder = CtcDecoder::new(self.vocabulary).with_softmax(self.apply_softmax);
        Ok(HandwritingOcr {
            inference,
            detector: Detector::new(self.detection_model, self.detection),
            recognizer: Recognizer::new(
                self.recognition_model,
                second_pass_model,
                decoder,
                self.recognition,
            ),
        })
    }
}

impl Default for HandwritingOcrBuilder {
    fn default() -> Self {
        Self {
            inference: None,
            detection_model: DETECTION_MODEL.to_string(),
            recognition_model: RECOGNITION_MODEL.to_string(),
            second_pass_model: None,
            detection: DetectionOptions::default(),
            recognition: RecognitionOptions::default(),
            vocabulary: Vocabulary::default(),
            apply_softmax: true,
        }
    }
}

/// Detection followed by two-pass recognition against one inference backend.
pub struct HandwritingOcr {
    inference: Arc<dyn InferencePort>,
    detector: Detector,
    recognizer: Recognizer,
}

impl HandwritingOcr {
    pub fn builder() -> HandwritingOcrBuilder {
        HandwritingOcrBuilder::new()
    }

    /// Connects the configured backend and applies every pipeline setting.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        Self::builder()
            .inference(config.inference.connect()?)
            .second_pass_model(config.recognition.second_pass_model.clone())
            .detection_options((&config.detection).into())
            .recognition_options((&config.recognition).into())
            .apply_softmax(config.recognition.apply_softmax)
            .build()
    }

    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub async fn recognize(&self, image: &DynamicImage) -> Result<Transcription> {
        let boxes = self.detector.detect(self.inference.as_ref(), image).await?;
        self.recognizer
            .recognize(self.inference.as_ref(), &boxes, image.to_luma8())
            .await
    }
}
