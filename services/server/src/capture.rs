//! Camera capture with an exclusive, scoped lease.
//!
//! The camera is a single physical resource shared by every request. A
//! request takes a [`CameraLease`] (bounded wait, otherwise [`CaptureError::Busy`]),
//! opens the device, waits out the warm-up and then makes a bounded number of
//! grab attempts. The lease closes the device when it is dropped, so the
//! camera is released on every exit path, including cancellation.

use crate::config::CameraConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use halo_protocol::{Interrupted, Pause};
use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur while capturing a frame.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("No frame captured after {attempts} attempts")]
    CaptureTimeout { attempts: u32 },

    #[error("Camera busy")]
    Busy,

    #[error("Camera read failed: {0}")]
    Device(String),

    #[error("Capture interrupted")]
    Interrupted(#[from] Interrupted),
}

/// A video device that can be opened, read and closed.
#[async_trait]
pub trait CameraDevice: Send {
    /// Open the device. Called once per lease.
    async fn open(&mut self) -> Result<(), CaptureError>;

    /// Try to read one frame. `Ok(None)` means no frame was ready.
    async fn grab(&mut self) -> Result<Option<RgbImage>, CaptureError>;

    /// Release the device. Must not fail.
    fn close(&mut self);
}

/// One captured frame, owned by a single request.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
    /// 1-based grab attempt that produced the frame
    pub attempt: u32,
}

/// Slack on top of `grab_timeout` before a grab is abandoned. Devices bound
/// their own reads by `grab_timeout`, so they get to report first.
const GRAB_DEADLINE_MARGIN: Duration = Duration::from_millis(500);

/// Timing for one capture.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub warmup: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub lease_wait: Duration,
    pub grab_timeout: Duration,
}

impl CaptureSettings {
    /// Hard limit on one grab call.
    pub fn grab_deadline(&self) -> Duration {
        self.grab_timeout + GRAB_DEADLINE_MARGIN
    }
}

impl From<&CameraConfig> for CaptureSettings {
    fn from(config: &CameraConfig) -> Self {
        Self {
            warmup: config.warmup(),
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay(),
            lease_wait: config.lease_wait(),
            grab_timeout: config.grab_timeout(),
        }
    }
}

/// Exclusive access to the camera for one request.
pub struct CameraLease {
    guard: OwnedMutexGuard<Box<dyn CameraDevice>>,
    opened: bool,
}

impl CameraLease {
    async fn open(&mut self) -> Result<(), CaptureError> {
        self.guard.open().await?;
        self.opened = true;
        Ok(())
    }

    async fn grab(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        self.guard.grab().await
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        if self.opened {
            self.guard.close();
            debug!("Camera released");
        }
    }
}

/// Writes captured frames to disk as `frame_<YYYYmmdd_HHMMSS>_<attempt>.jpg`.
#[derive(Debug, Clone)]
pub struct FrameArchive {
    dir: PathBuf,
}

impl FrameArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(captured_at: DateTime<Utc>, attempt: u32) -> String {
        format!("frame_{}_{}.jpg", captured_at.format("%Y%m%d_%H%M%S"), attempt)
    }

    /// Store a frame. Failures are logged and otherwise ignored.
    pub async fn store(&self, frame: &CapturedFrame) -> Option<PathBuf> {
        let path = self
            .dir
            .join(Self::file_name(frame.captured_at, frame.attempt));

        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %e, "Failed to create frame archive");
            return None;
        }

        let image = frame.image.clone();
        let target = path.clone();
        let written =
            tokio::task::spawn_blocking(move || image.save_with_format(&target, ImageFormat::Jpeg))
                .await;

        match written {
            Ok(Ok(())) => {
                debug!(path = %path.display(), "Frame archived");
                Some(path)
            }
            Ok(Err(e)) => {
                warn!(path = %path.display(), error = %e, "Failed to archive frame");
                None
            }
            Err(e) => {
                warn!(error = %e, "Frame archive task failed");
                None
            }
        }
    }
}

/// Hands out frames from the shared camera, one request at a time.
#[derive(Clone)]
pub struct CaptureService {
    camera: Arc<Mutex<Box<dyn CameraDevice>>>,
    settings: CaptureSettings,
    archive: Option<FrameArchive>,
    pause: Pause,
}

impl CaptureService {
    pub fn new(camera: Box<dyn CameraDevice>, settings: CaptureSettings) -> Self {
        Self {
            camera: Arc::new(Mutex::new(camera)),
            settings,
            archive: None,
            pause: Pause::new(),
        }
    }

    pub fn with_archive(mut self, archive: FrameArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_pause(mut self, pause: Pause) -> Self {
        self.pause = pause;
        self
    }

    /// Wait (bounded) for exclusive access to the camera.
    async fn lease(&self) -> Result<CameraLease, CaptureError> {
        let guard = tokio::time::timeout(self.settings.lease_wait, self.camera.clone().lock_owned())
            .await
            .map_err(|_| CaptureError::Busy)?;

        Ok(CameraLease {
            guard,
            opened: false,
        })
    }

    /// Open the camera, wait for it to settle and grab one frame.
    #[instrument(skip(self))]
    pub async fn acquire_frame(&self) -> Result<CapturedFrame, CaptureError> {
        let frame = {
            let mut lease = match self.lease().await {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(
                        wait_ms = self.settings.lease_wait.as_millis() as u64,
                        "Camera still in use, rejecting capture"
                    );
                    return Err(e);
                }
            };

            if let Err(e) = lease.open().await {
                error!(error = %e, "Could not open camera");
                return Err(e);
            }

            self.pause.wait(self.settings.warmup).await?;
            self.grab_with_retry(&mut lease).await?
        };

        info!(attempt = frame.attempt, "Frame captured");

        if let Some(archive) = &self.archive {
            archive.store(&frame).await;
        }

        Ok(frame)
    }

    async fn grab_with_retry(&self, lease: &mut CameraLease) -> Result<CapturedFrame, CaptureError> {
        let attempts = self.settings.max_attempts;

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.settings.grab_deadline(), lease.grab()).await {
                Ok(Ok(Some(image))) => {
                    return Ok(CapturedFrame {
                        image,
                        captured_at: Utc::now(),
                        attempt,
                    });
                }
                Ok(Ok(None)) => warn!(attempt = attempt, "No frame available"),
                Ok(Err(e)) => warn!(attempt = attempt, error = %e, "Frame grab failed"),
                Err(_) => warn!(
                    attempt = attempt,
                    timeout_ms = self.settings.grab_deadline().as_millis() as u64,
                    "Frame grab timed out"
                ),
            }

            if attempt < attempts {
                self.pause.wait(self.settings.retry_delay).await?;
            }
        }

        metrics::counter!("halo.capture.failures").increment(1);
        error!(attempts = attempts, "Capture attempts exhausted");
        Err(CaptureError::CaptureTimeout { attempts })
    }
}
