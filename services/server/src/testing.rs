//! Scripted stand-ins for the camera, the classifier and the store.
//!
//! Used by the unit tests here and by end-to-end tests that run the real
//! router without a webcam or an inference service.

use crate::capture::{CameraDevice, CaptureError};
use crate::classification::{Classifier, ClassifierError, ModelInput};
use crate::event_store::{ClassificationEvent, EventQuery, EventStore, LabelCount, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use halo_protocol::Label;
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct CameraCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    grabs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Camera replaying a script of grab results.
///
/// Each `Some(())` in the script yields a small solid frame, each `None` an
/// empty read. Once the script runs out every grab comes back empty.
#[derive(Clone)]
pub struct ScriptedCamera {
    script: Arc<Mutex<VecDeque<Option<()>>>>,
    counters: Arc<CameraCounters>,
    unplugged: Arc<AtomicBool>,
}

impl ScriptedCamera {
    pub fn with_script(script: Vec<Option<()>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            counters: Arc::default(),
            unplugged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Camera that delivers a frame on each of the next `frames` grabs.
    pub fn with_frames(frames: usize) -> Self {
        Self::with_script(vec![Some(()); frames])
    }

    /// Camera that opens but never produces a frame.
    pub fn never_ready() -> Self {
        Self::with_script(Vec::new())
    }

    /// Camera that cannot be opened.
    pub fn unplugged() -> Self {
        let camera = Self::never_ready();
        camera.unplugged.store(true, Ordering::SeqCst);
        camera
    }

    pub fn push_frames(&self, frames: usize) {
        self.script.lock().extend(std::iter::repeat(Some(())).take(frames));
    }

    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn grab_count(&self) -> usize {
        self.counters.grabs.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open handles seen.
    pub fn max_concurrent(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraDevice for ScriptedCamera {
    async fn open(&mut self) -> Result<(), CaptureError> {
        if self.unplugged.load(Ordering::SeqCst) {
            return Err(CaptureError::CameraUnavailable(
                "no such device".to_string(),
            ));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(())
    }

    async fn grab(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        self.counters.grabs.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front().flatten();
        Ok(next.map(|()| RgbImage::from_pixel(64, 48, Rgb([120, 110, 90]))))
    }

    fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Classifier that always answers with the same label.
#[derive(Clone)]
pub struct FixedClassifier {
    label: Label,
    calls: Arc<AtomicUsize>,
}

impl FixedClassifier {
    pub fn new(label: Label) -> Self {
        Self {
            label,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn predict(&self, _input: &ModelInput) -> Result<Vec<f32>, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut probabilities = vec![0.05; Label::ALL.len()];
        probabilities[self.label.model_index()] = 0.9;
        Ok(probabilities)
    }
}

/// Event store whose writes always fail.
#[derive(Default)]
pub struct UnavailableEventStore {
    attempts: AtomicUsize,
}

impl UnavailableEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for UnavailableEventStore {
    async fn append(&self, _event: &ClassificationEvent) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("database offline".to_string()))
    }

    async fn query(&self, _query: &EventQuery) -> Result<Vec<ClassificationEvent>, StoreError> {
        Err(StoreError::Unavailable("database offline".to_string()))
    }

    async fn summary(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<LabelCount>, StoreError> {
        Err(StoreError::Unavailable("database offline".to_string()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("database offline".to_string()))
    }
}
