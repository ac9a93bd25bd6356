//! Chat front end: a per-session state machine that walks a user through
//! uploading a photo, rating the transcription and correcting it.
//!
//! Every session owns its [`ConversationState`]; [`Sessions`] keys them by
//! session id and serialises events within one session only.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::api::{PredictResponse, RateRequest, TranscribeRequest};

/// Ratings at or below this ask the user for the correct text.
pub const CORRECTION_RATING: u8 = 3;

pub const GREETING: &str = "Please upload an image with text.";
pub const HELP: &str =
    "This bot transcribes handwritten text. Please upload an image to get started.";
pub const PROCESSING: &str = "Photo uploaded, processing!";
pub const RATE_PROMPT: &str = "Rate the recognition quality (1-5), or skip:";
pub const FAILURE: &str = "Something went wrong";
pub const RATING_SKIPPED: &str = "Rating skipped";
pub const RATING_FAILED: &str = "Could not save the rating";
pub const CORRECTION_PROMPT: &str = "Please write the text that should have been recognized:";
pub const CORRECTION_THANKS: &str = "Thank you for providing the correct text!";
pub const CORRECTION_FAILED: &str = "Could not save the correct text";
pub const READY: &str = "You can now send a new image for recognition.";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend answered with status {0}")]
    Status(u16),
}

/// The recognition service as seen from the chat front end.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn predict(
        &self,
        user_id: &str,
        request_id: &str,
        image: Vec<u8>,
    ) -> Result<PredictResponse, BackendError>;

    async fn rate(&self, request_id: &str, rating: u8) -> Result<(), BackendError>;

    async fn transcribe(&self, request_id: &str, transcription: &str) -> Result<(), BackendError>;
}

/// [`Backend`] over the service's HTTP API.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(BackendError::Status(response.status().as_u16()))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn predict(
        &self,
        user_id: &str,
        request_id: &str,
        image: Vec<u8>,
    ) -> Result<PredictResponse, BackendError> {
        let form = reqwest::multipart::Form::new()
            .text("user_id", user_id.to_string())
            .text("request_id", request_id.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(image).file_name("photo.jpg"),
            );
        let response = self
            .client
            .post(self.url("predict"))
            .multipart(form)
            .send()
            .await?;
        Ok(check(response)?.json().await?)
    }

    async fn rate(&self, request_id: &str, rating: u8) -> Result<(), BackendError> {
        let request = RateRequest {
            request_id: request_id.to_string(),
            rating: rating.into(),
        };
        let response = self.client.post(self.url("rate")).json(&request).send().await?;
        check(response).map(|_| ())
    }

    async fn transcribe(&self, request_id: &str, transcription: &str) -> Result<(), BackendError> {
        let request = TranscribeRequest {
            request_id: request_id.to_string(),
            transcription: transcription.to_string(),
        };
        let response = self
            .client
            .post(self.url("transcribe"))
            .json(&request)
            .send()
            .await?;
        check(response).map(|_| ())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConversationState {
    /// No `/start` yet.
    #[default]
    Idle,
    AwaitingPhoto,
    AwaitingRating {
        request_id: String,
    },
    AwaitingCorrection {
        request_id: String,
        rating: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    Help,
    Clear,
    Photo(Vec<u8>),
    /// `None` skips rating.
    Rating(Option<u8>),
    Text(String),
}

/// Applies one event. Events the current state does not expect leave it
/// unchanged and produce no reply.
#[instrument(level = "debug", skip(backend, event))]
pub async fn step<B: Backend + ?Sized>(
    backend: &B,
    user_id: &str,
    state: ConversationState,
    event: Event,
) -> (ConversationState, Vec<String>) {
    use ConversationState::*;

    match (state, event) {
        (_, Event::Start) => (AwaitingPhoto, vec![GREETING.to_string()]),
        (_, Event::Help) => (AwaitingPhoto, vec![HELP.to_string()]),
        (_, Event::Clear) => (AwaitingPhoto, Vec::new()),

        (AwaitingPhoto, Event::Photo(image)) => {
            let request_id = Uuid::new_v4().to_string();
            match backend.predict(user_id, &request_id, image).await {
                Ok(answer) => {
                    let reply = format!(
                        "Model answer: {}, confidence {:.2}%",
                        answer.prediction,
                        answer.confidence * 100.0
                    );
                    (
                        AwaitingRating {
                            request_id: answer.request_id,
                        },
                        vec![PROCESSING.to_string(), reply, RATE_PROMPT.to_string()],
                    )
                }
                Err(e) => {
                    log::warn!("Prediction failed for user {user_id}: {e}");
                    (
                        AwaitingPhoto,
                        vec![PROCESSING.to_string(), FAILURE.to_string()],
                    )
                }
            }
        }

        (AwaitingRating { .. }, Event::Rating(None)) => {
            (AwaitingPhoto, vec![RATING_SKIPPED.to_string()])
        }
        (AwaitingRating { request_id }, Event::Rating(Some(rating))) if (1..=5).contains(&rating) => {
            match backend.rate(&request_id, rating).await {
                Ok(()) if rating <= CORRECTION_RATING => (
                    AwaitingCorrection { request_id, rating },
                    vec![
                        format!("Thank you for the rating: {rating} ⭐"),
                        CORRECTION_PROMPT.to_string(),
                    ],
                ),
                Ok(()) => (
                    AwaitingPhoto,
                    vec![format!("Thank you for the rating: {rating} ⭐")],
                ),
                Err(e) => {
                    log::warn!("Saving rating for {request_id} failed: {e}");
                    (AwaitingPhoto, vec![RATING_FAILED.to_string()])
                }
            }
        }

        (AwaitingCorrection { request_id, .. }, Event::Text(text)) => {
            let reply = match backend.transcribe(&request_id, &text).await {
                Ok(()) => CORRECTION_THANKS,
                Err(e) => {
                    log::warn!("Saving transcription for {request_id} failed: {e}");
                    CORRECTION_FAILED
                }
            };
            (AwaitingPhoto, vec![reply.to_string(), READY.to_string()])
        }

        (state, event) => {
            log::debug!("Ignoring {event:?} in state {state:?}");
            (state, Vec::new())
        }
    }
}

type Session = Arc<tokio::sync::Mutex<ConversationState>>;

/// Conversation states keyed by session id, in front of one backend.
pub struct Sessions<B: ?Sized> {
    sessions: parking_lot::Mutex<HashMap<String, Session>>,
    backend: Arc<B>,
}

impl<B: Backend + ?Sized> Sessions<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            sessions: parking_lot::Mutex::new(HashMap::new()),
            backend,
        }
    }

    fn session(&self, session_id: &str) -> Session {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Runs `event` against the session's state. Events of one session are
    /// handled one at a time; different sessions proceed independently.
    pub async fn dispatch(&self, session_id: &str, event: Event) -> Vec<String> {
        let session = self.session(session_id);
        let mut state = session.lock().await;
        let (next, replies) =
            step(self.backend.as_ref(), session_id, std::mem::take(&mut *state), event).await;
        *state = next;
        replies
    }

    /// Current state; unknown sessions read as `Idle` without being created.
    pub async fn state(&self, session_id: &str) -> ConversationState {
        let session = self.sessions.lock().get(session_id).cloned();
        match session {
            Some(session) => session.lock().await.clone(),
            None => ConversationState::default(),
        }
    }

    /// Drops the session's context. Returns whether it existed.
    pub fn end(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Predict(String),
        Rate(String, u8),
        Transcribe(String, String),
    }

    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<Call>>,
        fail: bool,
    }

    impl FakeBackend {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn result(&self) -> Result<(), BackendError> {
            if self.fail {
                Err(BackendError::Status(500))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn predict(
            &self,
            user_id: &str,
            request_id: &str,
            _image: Vec<u8>,
        ) -> Result<PredictResponse, BackendError> {
            self.calls.lock().push(Call::Predict(user_id.to_string()));
            self.result()?;
            Ok(PredictResponse {
                request_id: request_id.to_string(),
                prediction: "привет".to_string(),
                confidence: 0.8765,
                status: "ok".to_string(),
            })
        }

        async fn rate(&self, request_id: &str, rating: u8) -> Result<(), BackendError> {
            self.calls.lock().push(Call::Rate(request_id.to_string(), rating));
            self.result()
        }

        async fn transcribe(&self, request_id: &str, text: &str) -> Result<(), BackendError> {
            self.calls
                .lock()
                .push(Call::Transcribe(request_id.to_string(), text.to_string()));
            self.result()
        }
    }

    async fn rated_session(backend: Arc<FakeBackend>) -> (Sessions<FakeBackend>, String) {
        let sessions = Sessions::new(backend);
        sessions.dispatch("chat-1", Event::Start).await;
        let replies = sessions.dispatch("chat-1", Event::Photo(vec![1, 2, 3])).await;
        assert_eq!(replies[1], "Model answer: привет, confidence 87.65%");
        let ConversationState::AwaitingRating { request_id } = sessions.state("chat-1").await else {
            panic!("expected to await a rating");
        };
        (sessions, request_id)
    }

    #[tokio::test]
    async fn photos_are_ignored_before_start() {
        let backend = Arc::new(FakeBackend::default());
        let sessions = Sessions::new(backend.clone());
        let replies = sessions.dispatch("chat-1", Event::Photo(vec![0])).await;
        assert!(replies.is_empty());
        assert_eq!(sessions.state("chat-1").await, ConversationState::Idle);
        assert!(backend.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn high_rating_finishes_the_round() {
        let backend = Arc::new(FakeBackend::default());
        let (sessions, request_id) = rated_session(backend.clone()).await;
        let replies = sessions.dispatch("chat-1", Event::Rating(Some(5))).await;
        assert_eq!(replies, vec!["Thank you for the rating: 5 ⭐".to_string()]);
        assert_eq!(sessions.state("chat-1").await, ConversationState::AwaitingPhoto);
        assert_eq!(backend.calls.lock()[1], Call::Rate(request_id, 5));
    }

    #[tokio::test]
    async fn low_rating_asks_for_a_correction() {
        let backend = Arc::new(FakeBackend::default());
        let (sessions, request_id) = rated_session(backend.clone()).await;

        let replies = sessions.dispatch("chat-1", Event::Rating(Some(2))).await;
        assert_eq!(replies[1], CORRECTION_PROMPT);
        assert_eq!(
            sessions.state("chat-1").await,
            ConversationState::AwaitingCorrection {
                request_id: request_id.clone(),
                rating: 2
            }
        );

        let replies = sessions
            .dispatch("chat-1", Event::Text("пока".to_string()))
            .await;
        assert_eq!(replies, vec![CORRECTION_THANKS.to_string(), READY.to_string()]);
        assert_eq!(sessions.state("chat-1").await, ConversationState::AwaitingPhoto);
        assert_eq!(
            backend.calls.lock().last(),
            Some(&Call::Transcribe(request_id, "пока".to_string()))
        );
    }

    #[tokio::test]
    async fn skipping_returns_to_photos() {
        let backend = Arc::new(FakeBackend::default());
        let (sessions, _) = rated_session(backend.clone()).await;
        let replies = sessions.dispatch("chat-1", Event::Rating(None)).await;
        assert_eq!(replies, vec![RATING_SKIPPED.to_string()]);
        assert_eq!(sessions.state("chat-1").await, ConversationState::AwaitingPhoto);
        assert_eq!(backend.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn ratings_outside_the_rating_state_are_ignored() {
        let backend = Arc::new(FakeBackend::default());
        let sessions = Sessions::new(backend.clone());
        sessions.dispatch("chat-1", Event::Start).await;
        assert!(sessions.dispatch("chat-1", Event::Rating(Some(4))).await.is_empty());
        assert!(sessions
            .dispatch("chat-1", Event::Text("hello".to_string()))
            .await
            .is_empty());
        assert_eq!(sessions.state("chat-1").await, ConversationState::AwaitingPhoto);
        assert!(backend.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_keeps_waiting_for_a_photo() {
        let backend = Arc::new(FakeBackend::failing());
        let sessions = Sessions::new(backend);
        sessions.dispatch("chat-1", Event::Start).await;
        let replies = sessions.dispatch("chat-1", Event::Photo(vec![1])).await;
        assert_eq!(replies.last().map(String::as_str), Some(FAILURE));
        assert_eq!(sessions.state("chat-1").await, ConversationState::AwaitingPhoto);
    }

    #[tokio::test]
    async fn sessions_do_not_interfere() {
        let backend = Arc::new(FakeBackend::default());
        let (sessions, _) = rated_session(backend).await;
        sessions.dispatch("chat-2", Event::Start).await;
        assert!(sessions.dispatch("chat-2", Event::Rating(Some(1))).await.is_empty());
        assert!(matches!(
            sessions.state("chat-1").await,
            ConversationState::AwaitingRating { .. }
        ));
        assert_eq!(sessions.state("chat-2").await, ConversationState::AwaitingPhoto);
    }

    #[tokio::test]
    async fn clear_resets_a_pending_correction() {
        let backend = Arc::new(FakeBackend::default());
        let (sessions, _) = rated_session(backend).await;
        sessions.dispatch("chat-1", Event::Rating(Some(1))).await;
        let replies = sessions.dispatch("chat-1", Event::Clear).await;
        assert!(replies.is_empty());
        assert_eq!(sessions.state("chat-1").await, ConversationState::AwaitingPhoto);
    }

    #[tokio::test]
    async fn ended_sessions_are_forgotten() {
        let backend = Arc::new(FakeBackend::default());
        let (sessions, _) = rated_session(backend.clone()).await;
        sessions.dispatch("chat-2", Event::Start).await;
        assert_eq!(sessions.len(), 2);

        assert!(sessions.end("chat-1"));
        assert!(!sessions.end("chat-1"));
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.state("chat-1").await, ConversationState::Idle);
        assert_eq!(sessions.len(), 1);

        // a late rating for the ended session starts nothing
        assert!(sessions.dispatch("chat-1", Event::Rating(Some(2))).await.is_empty());
        assert_eq!(backend.calls.lock().len(), 1);
        assert!(sessions.end("chat-2"));
        assert!(sessions.end("chat-1"));
        assert!(sessions.is_empty());
    }
}
