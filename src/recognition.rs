use futures::future::try_join_all;
use image::GrayImage;
use tracing::instrument;

use crate::{
    crop::{crop_text_box, Crop, CropOptions},
    ctc::CtcDecoder,
    inference::InferencePort,
    BoxResult, DecodedText, Result, TextBox, Transcription,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognitionOptions {
    pub crop: CropOptions,
    /// First-pass results below this get a second pass.
    pub low_confidence: f32,
    /// Boxes below this are left out of the transcription.
    pub acceptance: f32,
    /// Contrast target for second-pass crops, `None` to reuse the first crop.
    pub second_pass_contrast: Option<f32>,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            crop: CropOptions::default(),
            low_confidence: 0.1,
            acceptance: 0.6,
            second_pass_contrast: Some(0.5),
        }
    }
}

/// Outcome of the first pass over one box.
#[derive(Debug, Clone, PartialEq)]
pub enum FirstPass {
    Confident(DecodedText),
    NeedsSecondPass(DecodedText),
}

impl FirstPass {
    pub fn classify(decoded: DecodedText, low_confidence: f32) -> Self {
        if decoded.confidence < low_confidence {
            Self::NeedsSecondPass(decoded)
        } else {
            Self::Confident(decoded)
        }
    }
}

/// Keeps the second-pass result unless the first one is strictly better.
pub fn resolve(first: DecodedText, second: DecodedText) -> DecodedText {
    if first.confidence > second.confidence {
        first
    } else {
        second
    }
}

/// Drops boxes under `acceptance` and joins the rest in the given order.
pub fn aggregate(results: Vec<BoxResult>, acceptance: f32) -> Transcription {
    let boxes = results
        .into_iter()
        .filter(|result| result.text.confidence >= acceptance)
        .collect::<Vec<_>>();
    if boxes.is_empty() {
        return Transcription::default();
    }
    let text = boxes
        .iter()
        .map(|result| result.text.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let confidence =
        boxes.iter().map(|result| result.text.confidence).sum::<f32>() / boxes.len() as f32;
    Transcription {
        text,
        confidence,
        boxes,
    }
}

pub struct Recognizer {
    model: String,
    second_pass_model: String,
    decoder: CtcDecoder,
    options: RecognitionOptions,
}

impl Recognizer {
    pub fn new(
        model: impl Into<String>,
        second_pass_model: impl Into<String>,
        decoder: CtcDecoder,
        options: RecognitionOptions,
    ) -> Self {
        Self {
            model: model.into(),
            second_pass_model: second_pass_model.into(),
            decoder,
            options,
        }
    }

    /// Recognizes every box and aggregates the accepted ones. Crops are cut
    /// on the blocking pool; boxes are then recognized concurrently and the
    /// output keeps their input order.
    #[instrument(level = "debug", skip_all, fields(boxes = boxes.len()))]
    pub async fn recognize<P: InferencePort + ?Sized>(
        &self,
        port: &P,
        boxes: &[TextBox],
        image: GrayImage,
    ) -> Result<Transcription> {
        let crop_options = self.options.crop;
        let owned = boxes.to_vec();
        let crops = tokio::task::spawn_blocking(move || {
            owned
                .iter()
                .map(|text_box| crop_text_box(text_box, &image, &crop_options))
                .collect::<Vec<_>>()
        })
        .await?;

        let pending = boxes
            .iter()
            .zip(crops)
            .filter_map(|(text_box, crop)| match crop {
                Ok(crop) => Some(self.recognize_crop(port, text_box, crop)),
                Err(error) => {
                    log::debug!("Skipping box {:?}: {error}", text_box.to_flat());
                    None
                }
            });
        let results = try_join_all(pending).await?;
        let transcription = aggregate(results, self.options.acceptance);
        log::debug!(
            "Accepted {} of {} boxes, confidence {}",
            transcription.boxes.len(),
            boxes.len(),
            transcription.confidence
        );
        Ok(transcription)
    }

    #[instrument(level = "trace", skip_all)]
    async fn recognize_crop<P: InferencePort + ?Sized>(
        &self,
        port: &P,
        text_box: &TextBox,
        crop: Crop,
    ) -> Result<BoxResult> {
        let first = self.run(port, &self.model, &crop).await?;
        let text = match FirstPass::classify(first, self.options.low_confidence) {
            FirstPass::Confident(decoded) => decoded,
            FirstPass::NeedsSecondPass(decoded) => {
                let crop = match self.options.second_pass_contrast {
                    Some(target) => crop.with_contrast(target),
                    None => crop,
                };
                let second = self.run(port, &self.second_pass_model, &crop).await?;
                log::trace!(
                    "Second pass: {} -> {}",
                    decoded.confidence,
                    second.confidence
                );
                resolve(decoded, second)
            }
        };
        Ok(BoxResult {
            bounds: text_box.clone(),
            text,
        })
    }

    async fn run<P: InferencePort + ?Sized>(
        &self,
        port: &P,
        model: &str,
        crop: &Crop,
    ) -> Result<DecodedText> {
        let output = port.infer(model, crop.to_tensor().into_dyn()).await?;
        log::trace!("Recognizer output size: {:?}", output.shape());
        Ok(self.decoder.decode_greedy(output.view())?)
    }
}
