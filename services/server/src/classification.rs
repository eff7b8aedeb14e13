//! Image classification.
//!
//! Frames are resized to the model's square input and scaled to `[0, 1]`
//! before being handed to a [`Classifier`]. The classifier returns one
//! probability per label in model order (`metal`, `paper`, `plastic`); the
//! label is the argmax and the confidence its probability. Confidence is
//! reported and stored but never gates sorting.

use crate::capture::CapturedFrame;
use async_trait::async_trait;
use halo_protocol::Label;
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors that can occur while classifying an image.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Could not decode image: {0}")]
    Decode(String),

    #[error("Inference request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Inference service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed inference output: {0}")]
    MalformedOutput(String),

    #[error("Invalid model input size: {0}")]
    InvalidInputSize(u32),
}

/// Preprocessed model input: `size x size x 3`, row-major, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInput {
    pub size: u32,
    pub data: Vec<f32>,
}

impl ModelInput {
    /// Resize `image` to `size x size` and normalize each channel by 255.
    pub fn from_image(image: &RgbImage, size: u32) -> Self {
        let resized = if image.width() == size && image.height() == size {
            image.clone()
        } else {
            image::imageops::resize(image, size, size, FilterType::Triangle)
        };

        let data = resized
            .as_raw()
            .iter()
            .map(|&v| f32::from(v) / 255.0)
            .collect();

        Self { size, data }
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.size as usize, self.size as usize, 3]
    }

    /// Nested `[row][column][channel]` view, the layout inference servers expect.
    pub fn to_nested(&self) -> Vec<Vec<[f32; 3]>> {
        let size = self.size as usize;
        if size == 0 {
            return Vec::new();
        }
        self.data
            .chunks_exact(size * 3)
            .map(|row| row.chunks_exact(3).map(|px| [px[0], px[1], px[2]]).collect())
            .collect()
    }
}

/// Something that turns a model input into per-label probabilities.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Probabilities in model order.
    async fn predict(&self, input: &ModelInput) -> Result<Vec<f32>, ClassifierError>;
}

/// Result of classifying one image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: Label,
    pub confidence: f32,
}

impl Classification {
    /// Pick the most probable label from a model output vector.
    pub fn from_probabilities(probabilities: &[f32]) -> Result<Self, ClassifierError> {
        if probabilities.len() != Label::ALL.len() {
            return Err(ClassifierError::MalformedOutput(format!(
                "expected {} probabilities, got {}",
                Label::ALL.len(),
                probabilities.len()
            )));
        }
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(ClassifierError::MalformedOutput(
                "non-finite probability".to_string(),
            ));
        }

        let (index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        let label = Label::from_model_index(index).ok_or_else(|| {
            ClassifierError::MalformedOutput(format!("no label for model index {}", index))
        })?;

        Ok(Self { label, confidence })
    }
}

/// Preprocesses images and runs them through the injected classifier.
#[derive(Clone)]
pub struct ClassificationService {
    classifier: Arc<dyn Classifier>,
    input_size: u32,
}

impl ClassificationService {
    pub fn new(classifier: Arc<dyn Classifier>, input_size: u32) -> Result<Self, ClassifierError> {
        if input_size == 0 {
            return Err(ClassifierError::InvalidInputSize(input_size));
        }
        Ok(Self {
            classifier,
            input_size,
        })
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Classify a decoded image.
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub async fn classify(&self, image: &RgbImage) -> Result<Classification, ClassifierError> {
        let input = ModelInput::from_image(image, self.input_size);

        let started = Instant::now();
        let probabilities = self.classifier.predict(&input).await?;
        let elapsed = started.elapsed();
        metrics::histogram!("halo.classify.latency_ms").record(elapsed.as_secs_f64() * 1000.0);

        let classification = Classification::from_probabilities(&probabilities)?;
        info!(
            label = %classification.label,
            confidence = classification.confidence,
            latency_ms = elapsed.as_millis() as u64,
            "Image classified"
        );
        Ok(classification)
    }

    pub async fn classify_frame(&self, frame: &CapturedFrame) -> Result<Classification, ClassifierError> {
        self.classify(&frame.image).await
    }

    /// Decode an encoded image (JPEG, PNG, ...) and classify it.
    pub async fn classify_bytes(&self, bytes: &[u8]) -> Result<Classification, ClassifierError> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| ClassifierError::Decode(e.to_string()))?
            .to_rgb8();
        debug!(width = image.width(), height = image.height(), "Uploaded image decoded");
        self.classify(&image).await
    }
}

#[derive(Serialize)]
struct PredictRequest {
    instances: Vec<Vec<Vec<[f32; 3]>>>,
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Vec<Vec<f32>>,
}

/// Classifier backed by a remote inference endpoint.
///
/// Speaks the TensorFlow Serving REST shape: the request carries
/// `{"instances": [<input>]}` and the reply `{"predictions": [[p0, p1, p2]]}`.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn predict(&self, input: &ModelInput) -> Result<Vec<f32>, ClassifierError> {
        let request = PredictRequest {
            instances: vec![input.to_nested()],
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut parsed: PredictResponse = response.json().await?;
        if parsed.predictions.is_empty() {
            return Err(ClassifierError::MalformedOutput(
                "empty predictions".to_string(),
            ));
        }
        Ok(parsed.predictions.swap_remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use image::Rgb;

    #[test]
    fn test_preprocess_resizes_and_normalizes() {
        let image = RgbImage::from_pixel(640, 480, Rgb([255, 0, 51]));
        let input = ModelInput::from_image(&image, 224);

        assert_eq!(input.shape(), [224, 224, 3]);
        assert_eq!(input.data.len(), 224 * 224 * 3);
        assert!((input.data[0] - 1.0).abs() < 1e-6);
        assert!(input.data[1].abs() < 1e-6);
        assert!((input.data[2] - 0.2).abs() < 1e-6);
        assert!(input.data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_nested_layout() {
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(1, 0, Rgb([255, 255, 255]));
        let nested = ModelInput::from_image(&image, 2).to_nested();

        assert_eq!(nested.len(), 2);
        assert_eq!(nested[0][1], [1.0, 1.0, 1.0]);
        assert_eq!(nested[1][0], [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_zero_input_size_rejected() {
        let classifier = MockClassifier::new();
        let result = ClassificationService::new(Arc::new(classifier), 0);
        assert!(matches!(result, Err(ClassifierError::InvalidInputSize(0))));

        let empty = ModelInput {
            size: 0,
            data: Vec::new(),
        };
        assert!(empty.to_nested().is_empty());
    }

    #[test]
    fn test_argmax_uses_model_order() {
        let c = Classification::from_probabilities(&[0.1, 0.7, 0.2]).unwrap();
        assert_eq!(c.label, Label::Paper);
        assert!((c.confidence - 0.7).abs() < 1e-6);

        let c = Classification::from_probabilities(&[0.9, 0.05, 0.05]).unwrap();
        assert_eq!(c.label, Label::Metal);

        let c = Classification::from_probabilities(&[0.2, 0.3, 0.5]).unwrap();
        assert_eq!(c.label, Label::Plastic);
    }

    #[test]
    fn test_malformed_output_rejected() {
        assert!(Classification::from_probabilities(&[0.5, 0.5]).is_err());
        assert!(Classification::from_probabilities(&[0.1, f32::NAN, 0.2]).is_err());
    }

    #[tokio::test]
    async fn test_service_classifies_with_injected_model() {
        let mut classifier = MockClassifier::new();
        classifier
            .expect_predict()
            .withf(|input| input.size == 224)
            .times(1)
            .returning(|_| Ok(vec![0.05, 0.15, 0.8]));

        let service = ClassificationService::new(Arc::new(classifier), 224).unwrap();
        let image = RgbImage::from_pixel(320, 240, Rgb([10, 20, 30]));
        let result = service.classify(&image).await.unwrap();

        assert_eq!(result.label, Label::Plastic);
    }

    #[tokio::test]
    async fn test_classifier_error_propagates() {
        let mut classifier = MockClassifier::new();
        classifier
            .expect_predict()
            .returning(|_| Err(ClassifierError::MalformedOutput("model not loaded".to_string())));

        let service = ClassificationService::new(Arc::new(classifier), 224).unwrap();
        let image = RgbImage::new(10, 10);
        assert!(service.classify(&image).await.is_err());
    }

    #[tokio::test]
    async fn test_classify_bytes_rejects_garbage() {
        let classifier = MockClassifier::new();
        let service = ClassificationService::new(Arc::new(classifier), 224).unwrap();

        let err = service.classify_bytes(b"not an image").await.unwrap_err();
        assert!(matches!(err, ClassifierError::Decode(_)));
    }

    #[tokio::test]
    async fn test_http_classifier_round_trip() {
        let app = Router::new().route(
            "/predict",
            post(|Json(body): Json<serde_json::Value>| async move {
                let rows = body["instances"][0].as_array().map(|r| r.len()).unwrap_or(0);
                assert_eq!(rows, 4);
                Json(serde_json::json!({ "predictions": [[0.1, 0.8, 0.1]] }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let classifier =
            HttpClassifier::new(format!("http://{}/predict", addr), Duration::from_secs(5)).unwrap();
        let service = ClassificationService::new(Arc::new(classifier), 4).unwrap();
        let image = RgbImage::from_pixel(16, 16, Rgb([0, 128, 255]));

        let result = service.classify(&image).await.unwrap();
        assert_eq!(result.label, Label::Paper);
    }

    #[tokio::test]
    async fn test_http_classifier_status_error() {
        let app = Router::new().route(
            "/predict",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "model loading") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let classifier =
            HttpClassifier::new(format!("http://{}/predict", addr), Duration::from_secs(5)).unwrap();
        let input = ModelInput::from_image(&RgbImage::new(2, 2), 2);

        let err = classifier.predict(&input).await.unwrap_err();
        assert!(matches!(err, ClassifierError::Status { status: 503, .. }));
    }
}
