//! Trigger request pipeline.
//!
//! ```text
//! Received ─▶ Capturing ─▶ Classifying ─▶ Persisting ─▶ Responding
//!    │            │             │
//!    └────────────┴─────────────┴──▶ error response
//! ```
//!
//! Only the first three phases can fail the request. A failed write in
//! `Persisting` is logged and the reply goes out regardless.

use crate::capture::{CaptureError, CaptureService};
use crate::classification::{Classification, ClassificationService, ClassifierError};
use crate::event_store::{ClassificationEvent, EventStore};
use halo_protocol::{ClassificationRequest, ProtocolError, INVALID_VALUE_MESSAGE};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Capturing,
    Classifying,
    Persisting,
    Responding,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestPhase::Received => "received",
            RequestPhase::Capturing => "capturing",
            RequestPhase::Classifying => "classifying",
            RequestPhase::Persisting => "persisting",
            RequestPhase::Responding => "responding",
        };
        f.write_str(name)
    }
}

/// Why a trigger request failed.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] ProtocolError),

    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Classification failed: {0}")]
    Classification(#[from] ClassifierError),
}

impl HandlerError {
    /// Phase the request was in when it failed.
    pub fn phase(&self) -> RequestPhase {
        match self {
            HandlerError::InvalidRequest(_) => RequestPhase::Received,
            HandlerError::Capture(_) => RequestPhase::Capturing,
            HandlerError::Classification(_) => RequestPhase::Classifying,
        }
    }

    /// True when the caller sent a bad request rather than the server failing.
    pub fn is_client_error(&self) -> bool {
        matches!(self, HandlerError::InvalidRequest(_))
    }

    /// Message returned to the caller in the `{"error": ...}` body.
    pub fn public_message(&self) -> String {
        match self {
            HandlerError::InvalidRequest(_) => INVALID_VALUE_MESSAGE.to_string(),
            HandlerError::Capture(CaptureError::CameraUnavailable(_)) => {
                "Could not open webcam.".to_string()
            }
            HandlerError::Capture(CaptureError::CaptureTimeout { attempts }) => {
                format!("Failed to capture frame {}.", attempts)
            }
            HandlerError::Capture(CaptureError::Busy) => {
                "Camera is busy with another request.".to_string()
            }
            HandlerError::Capture(e) => format!("Capture failed: {}", e),
            HandlerError::Classification(e) => format!("Classification failed: {}", e),
        }
    }
}

/// Successful outcome of a trigger request.
#[derive(Debug, Clone, PartialEq)]
pub struct SortReply {
    pub classification: Classification,
    pub event_id: Uuid,
}

impl SortReply {
    /// Actuation token sent back to the edge.
    pub fn token(&self) -> String {
        self.classification.label.token()
    }
}

/// Runs one trigger request through capture, classification and storage.
#[derive(Clone)]
pub struct RequestHandler {
    capture: CaptureService,
    classification: ClassificationService,
    store: Arc<dyn EventStore>,
    write_wait: Duration,
}

impl RequestHandler {
    pub fn new(
        capture: CaptureService,
        classification: ClassificationService,
        store: Arc<dyn EventStore>,
        write_wait: Duration,
    ) -> Self {
        Self {
            capture,
            classification,
            store,
            write_wait,
        }
    }

    pub fn classification(&self) -> &ClassificationService {
        &self.classification
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Handle a raw trigger request body.
    #[instrument(skip(self, body), fields(request_id = %Uuid::new_v4()))]
    pub async fn handle(&self, body: &[u8]) -> Result<SortReply, HandlerError> {
        let result = self.run(body).await;

        let outcome = match &result {
            Ok(_) => "sorted",
            Err(e) if e.is_client_error() => "rejected",
            Err(_) => "failed",
        };
        metrics::counter!("halo.requests", "outcome" => outcome).increment(1);

        if let Err(e) = &result {
            if e.is_client_error() {
                warn!(phase = %e.phase(), error = %e, "Trigger request rejected");
            } else {
                error!(phase = %e.phase(), error = %e, "Trigger request failed");
            }
        }
        result
    }

    async fn run(&self, body: &[u8]) -> Result<SortReply, HandlerError> {
        let mut phase = RequestPhase::Received;
        debug!(phase = %phase, "Trigger request received");
        let request = ClassificationRequest::parse(body)?;
        request.validate()?;

        phase = RequestPhase::Capturing;
        debug!(phase = %phase, "Capturing frame");
        let frame = self.capture.acquire_frame().await?;

        phase = RequestPhase::Classifying;
        debug!(phase = %phase, attempt = frame.attempt, "Classifying frame");
        let classification = self.classification.classify_frame(&frame).await?;

        phase = RequestPhase::Persisting;
        debug!(phase = %phase, "Recording classification");
        let event = ClassificationEvent::new(
            classification.label,
            classification.confidence,
            frame.captured_at,
        );
        let event_id = event.id;
        self.persist(event).await;

        phase = RequestPhase::Responding;
        let reply = SortReply {
            classification,
            event_id,
        };
        info!(
            phase = %phase,
            label = %classification.label,
            token = %reply.token(),
            "Responding with sort command"
        );
        Ok(reply)
    }

    /// Write the event without letting the store hold up the reply.
    ///
    /// The write runs on its own task. It is given `write_wait` to finish; a
    /// slower write keeps going in the background.
    async fn persist(&self, event: ClassificationEvent) {
        let store = self.store.clone();
        let mut write = tokio::spawn(async move {
            match store.append(&event).await {
                Ok(()) => {
                    metrics::counter!("halo.events.persisted").increment(1);
                    debug!(event_id = %event.id, "Classification event persisted");
                }
                Err(e) => {
                    metrics::counter!("halo.events.persist_failures").increment(1);
                    error!(event_id = %event.id, label = %event.label, error = %e, "Failed to persist classification event");
                }
            }
        });

        if tokio::time::timeout(self.write_wait, &mut write).await.is_err() {
            warn!(
                wait_ms = self.write_wait.as_millis() as u64,
                "Event write still pending, responding without waiting"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSettings;
    use crate::classification::MockClassifier;
    use crate::event_store::{InMemoryEventStore, MockEventStore, StoreError};
    use crate::testing::{FixedClassifier, ScriptedCamera};
    use halo_protocol::Label;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            warmup: Duration::from_secs(5),
            max_attempts: 2,
            retry_delay: Duration::from_secs(1),
            lease_wait: Duration::from_secs(30),
            grab_timeout: Duration::from_secs(1),
        }
    }

    fn handler(
        camera: &ScriptedCamera,
        classifier: Arc<dyn crate::classification::Classifier>,
        store: Arc<dyn EventStore>,
    ) -> RequestHandler {
        RequestHandler::new(
            CaptureService::new(Box::new(camera.clone()), settings()),
            ClassificationService::new(classifier, 224).unwrap(),
            store,
            Duration::from_secs(2),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_paper_request_persists_and_replies() {
        let camera = ScriptedCamera::with_frames(1);
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler(&camera, Arc::new(FixedClassifier::new(Label::Paper)), store.clone());

        let reply = handler.handle(br#"{"value": 1}"#).await.unwrap();

        assert_eq!(reply.token(), "Servo_paper");
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label, Label::Paper);
        assert_eq!(events[0].id, reply.event_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_value_has_no_side_effects() {
        let camera = ScriptedCamera::with_frames(1);
        let classifier = FixedClassifier::new(Label::Paper);
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler(&camera, Arc::new(classifier.clone()), store.clone());

        let bodies: [&[u8]; 4] = [br#"{"value": 0}"#, br#"{}"#, b"value=1", br#"{"value": "1"}"#];
        for body in bodies {
            let err = handler.handle(body).await.unwrap_err();
            assert!(err.is_client_error());
            assert_eq!(err.phase(), RequestPhase::Received);
            assert_eq!(err.public_message(), INVALID_VALUE_MESSAGE);
        }

        assert_eq!(camera.open_count(), 0);
        assert_eq!(classifier.call_count(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_exhaustion_persists_nothing() {
        let camera = ScriptedCamera::never_ready();
        let classifier = FixedClassifier::new(Label::Paper);
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler(&camera, Arc::new(classifier.clone()), store.clone());

        let err = handler.handle(br#"{"value": 1}"#).await.unwrap_err();

        assert_eq!(err.phase(), RequestPhase::Capturing);
        assert_eq!(err.public_message(), "Failed to capture frame 2.");
        assert_eq!(camera.close_count(), 1);
        assert_eq!(classifier.call_count(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplugged_camera_message() {
        let camera = ScriptedCamera::unplugged();
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler(&camera, Arc::new(FixedClassifier::new(Label::Paper)), store);

        let err = handler.handle(br#"{"value": 1}"#).await.unwrap_err();
        assert_eq!(err.public_message(), "Could not open webcam.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_failure_persists_nothing() {
        let camera = ScriptedCamera::with_frames(1);
        let mut classifier = MockClassifier::new();
        classifier
            .expect_predict()
            .times(1)
            .returning(|_| Err(ClassifierError::MalformedOutput("empty predictions".to_string())));
        let mut store = MockEventStore::new();
        store.expect_append().never();

        let handler = handler(&camera, Arc::new(classifier), Arc::new(store));
        let err = handler.handle(br#"{"value": 1}"#).await.unwrap_err();

        assert_eq!(err.phase(), RequestPhase::Classifying);
        assert!(!err.is_client_error());
        assert_eq!(camera.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_does_not_fail_request() {
        let camera = ScriptedCamera::with_frames(1);
        let mut store = MockEventStore::new();
        store
            .expect_append()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("connection refused".to_string())));

        let handler = handler(&camera, Arc::new(FixedClassifier::new(Label::Plastic)), Arc::new(store));
        let reply = handler.handle(br#"{"value": 1}"#).await.unwrap();

        assert_eq!(reply.token(), "Servo_plastic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_does_not_hold_reply() {
        struct StalledStore;

        #[async_trait::async_trait]
        impl EventStore for StalledStore {
            async fn append(&self, _event: &ClassificationEvent) -> Result<(), StoreError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            async fn query(
                &self,
                _query: &crate::event_store::EventQuery,
            ) -> Result<Vec<ClassificationEvent>, StoreError> {
                Ok(Vec::new())
            }
            async fn summary(
                &self,
                _since: Option<chrono::DateTime<chrono::Utc>>,
            ) -> Result<Vec<crate::event_store::LabelCount>, StoreError> {
                Ok(Vec::new())
            }
            async fn ping(&self) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let camera = ScriptedCamera::with_frames(1);
        let handler = handler(&camera, Arc::new(FixedClassifier::new(Label::Metal)), Arc::new(StalledStore));

        let started = tokio::time::Instant::now();
        let reply = handler.handle(br#"{"value": 1}"#).await.unwrap();

        assert_eq!(reply.token(), "Servo_metal");
        // Warm-up plus the bounded write wait, nowhere near the stalled write.
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
