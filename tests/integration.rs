use std::{io::Cursor, sync::Arc};

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use handscript::{
    api::{self, AppState, PredictResponse, SimpleResponse},
    ctc::Vocabulary,
    inference::ScriptedInference,
    store::{MemoryStore, PredictionRecord, PredictionStore},
    HandwritingOcr,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::{Array3, Array4, ArrayD, Ix4};
use tower::ServiceExt;

const WORD: &str = "Да";

/// White word on a black 300x100 photo, spanning x 60..240 and y 35..65.
fn word_image() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(300, 100, |x, y| {
        if (60..240).contains(&x) && (35..65).contains(&y) {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    }))
}

/// Text score is high wherever the detector input is bright; map stride 2.
fn detect(input: &ArrayD<f32>) -> ArrayD<f32> {
    let input = input
        .view()
        .into_dimensionality::<Ix4>()
        .expect("detector input is NCHW");
    let (height, width) = (input.shape()[2] / 2, input.shape()[3] / 2);
    let mut output = Array4::<f32>::zeros((1, height, width, 2));
    for y in 0..height {
        for x in 0..width {
            if input[[0, 0, 2 * y, 2 * x]] > 0.0 {
                output[[0, y, x, 0]] = 0.95;
            }
        }
    }
    output.into_dyn()
}

fn class_of(vocabulary: &Vocabulary, character: char) -> usize {
    (1..vocabulary.len())
        .find(|&index| vocabulary.get(index) == Some(character))
        .expect("character is in the vocabulary")
}

/// "Д Д <blank> а а" with confident steps.
fn recognize(_: &ArrayD<f32>) -> ArrayD<f32> {
    let vocabulary = Vocabulary::default();
    let mut chars = WORD.chars();
    let (first, second) = (chars.next().unwrap(), chars.next().unwrap());
    let steps = [
        (class_of(&vocabulary, first), 0.97),
        (class_of(&vocabulary, first), 0.96),
        (0, 0.99),
        (class_of(&vocabulary, second), 0.95),
        (class_of(&vocabulary, second), 0.98),
    ];
    let classes = vocabulary.len();
    let mut output = Array3::<f32>::zeros((1, steps.len(), classes));
    for (t, (class, prob)) in steps.into_iter().enumerate() {
        for c in 0..classes {
            output[[0, t, c]] = (1.0 - prob) / (classes - 1) as f32;
        }
        output[[0, t, class]] = prob;
    }
    output.into_dyn()
}

fn scripted_port() -> ScriptedInference {
    ScriptedInference::new()
        .respond("detection", |input| Ok(detect(input)))
        .respond("recognition", |input| Ok(recognize(input)))
}

fn build_ocr(port: Arc<ScriptedInference>) -> HandwritingOcr {
    HandwritingOcr::builder()
        .inference(port)
        .apply_softmax(false)
        .build()
        .expect("Failed to build pipeline")
}

#[tokio::test]
async fn single_printed_word_is_transcribed() {
    let _ = env_logger::builder().is_test(true).try_init();

    let port = Arc::new(scripted_port());
    let ocr = build_ocr(port.clone());
    let transcription = ocr
        .recognize(&word_image())
        .await
        .expect("Failed recognition.");

    assert_eq!(transcription.boxes.len(), 1);
    let corners = transcription.boxes[0].bounds.corners();
    assert!(corners[0].x < 60.0 && corners[0].y < 35.0, "{corners:?}");
    assert!(corners[2].x > 239.0 && corners[2].y > 64.0, "{corners:?}");

    // one first pass, no second pass
    assert_eq!(port.calls_to("recognition"), 1);
    assert_eq!(port.calls_to("detection"), 1);
    assert_eq!(transcription.text, WORD);
    let expected = 0.97f32 * 0.96 * 0.95 * 0.98;
    assert!((transcription.confidence - expected).abs() < 1e-4);
    assert!(transcription.confidence > 0.6);
}

#[tokio::test]
async fn predict_rate_and_correct_over_http() {
    let _ = env_logger::builder().is_test(true).try_init();

    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(
        Arc::new(build_ocr(Arc::new(scripted_port()))),
        store.clone(),
    );
    let app = api::router(state, 8);

    let mut png = Cursor::new(Vec::new());
    word_image()
        .write_to(&mut png, ImageFormat::Png)
        .expect("Failed to encode image");
    let boundary = "integration-boundary";
    let mut body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"user_id\"\r\n\r\n42\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"request_id\"\r\n\r\nreq-42\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"word.png\"\r\n\
         Content-Type: image/png\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(png.get_ref());
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/predict")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let prediction: PredictResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(prediction.request_id, "req-42");
    assert_eq!(prediction.prediction, WORD);

    for (uri, json) in [
        ("/rate", serde_json::json!({"request_id": "req-42", "rating": 2})),
        (
            "/transcribe",
            serde_json::json!({"request_id": "req-42", "transcription": "Да!"}),
        ),
    ] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let reply: SimpleResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(reply.success);
    }

    let record: PredictionRecord = store
        .get_by_request_id("req-42")
        .await
        .unwrap()
        .expect("prediction was stored");
    assert_eq!(record.user_id, "42");
    assert_eq!(record.detections.len(), 1);
    assert_eq!(record.detections[0].text, WORD);
    assert_eq!(record.user_rating, Some(2));
    assert_eq!(record.user_transcription.as_deref(), Some("Да!"));
    assert!(record.processing_time >= 0.0);
}
