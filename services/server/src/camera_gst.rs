//! V4L2 camera through a GStreamer pipeline ending in an appsink.

use crate::capture::{CameraDevice, CaptureError};
use crate::config::CameraConfig;
use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use image::RgbImage;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the pipeline may take to reach PLAYING.
const START_TIMEOUT_SECS: u64 = 5;

/// Webcam read through `v4l2src`, converted to packed RGB.
pub struct GstCamera {
    device: String,
    width: u32,
    height: u32,
    grab_timeout: Duration,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
}

impl GstCamera {
    pub fn new(config: &CameraConfig) -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::CameraUnavailable(e.to_string()))?;

        Ok(Self {
            device: config.device.clone(),
            width: config.width,
            height: config.height,
            grab_timeout: config.grab_timeout(),
            pipeline: None,
            appsink: None,
        })
    }

    fn pipeline_description(&self) -> String {
        format!(
            "v4l2src device={device} \
             ! videoconvert ! videoscale \
             ! video/x-raw,format=RGB,width={width},height={height} \
             ! appsink name=sink sync=false max-buffers=1 drop=true",
            device = self.device,
            width = self.width,
            height = self.height,
        )
    }
}

fn launch(description: &str) -> Result<(gst::Pipeline, gst_app::AppSink), CaptureError> {
    let pipeline = gst::parse::launch(description)
        .map_err(|e| CaptureError::CameraUnavailable(e.to_string()))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| CaptureError::CameraUnavailable("Failed to cast to Pipeline".to_string()))?;

    let appsink = pipeline
        .by_name("sink")
        .ok_or_else(|| CaptureError::CameraUnavailable("appsink not found".to_string()))?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| CaptureError::CameraUnavailable("Could not cast to AppSink".to_string()))?;

    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| CaptureError::CameraUnavailable(e.to_string()))?;

    let (result, _state, _pending) = pipeline.state(gst::ClockTime::from_seconds(START_TIMEOUT_SECS));
    if result.is_err() {
        let _ = pipeline.set_state(gst::State::Null);
        return Err(CaptureError::CameraUnavailable(
            "Timeout waiting for pipeline to start".to_string(),
        ));
    }

    Ok((pipeline, appsink))
}

/// Copy `height` rows of packed RGB out of a buffer whose rows are `stride`
/// bytes apart.
fn pack_rgb(data: &[u8], width: usize, height: usize, stride: usize) -> Option<Vec<u8>> {
    let row = width * 3;
    if stride < row || height == 0 || data.len() < stride * (height - 1) + row {
        return None;
    }

    let mut packed = Vec::with_capacity(row * height);
    for y in 0..height {
        let start = y * stride;
        packed.extend_from_slice(&data[start..start + row]);
    }
    Some(packed)
}

fn frame_from_sample(sample: &gst::Sample) -> Result<RgbImage, CaptureError> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| CaptureError::Device("sample without buffer".to_string()))?;
    let caps = sample
        .caps()
        .ok_or_else(|| CaptureError::Device("sample without caps".to_string()))?;
    let structure = caps
        .structure(0)
        .ok_or_else(|| CaptureError::Device("caps without structure".to_string()))?;

    let width: i32 = structure
        .get("width")
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let height: i32 = structure
        .get("height")
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let (width, height) = (width.max(0) as u32, height.max(0) as u32);

    let map = buffer
        .map_readable()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let data = map.as_slice();
    let stride = if height > 0 { data.len() / height as usize } else { 0 };

    let packed = pack_rgb(data, width as usize, height as usize, stride).ok_or_else(|| {
        CaptureError::Device(format!(
            "buffer of {} bytes does not hold a {}x{} RGB frame",
            data.len(),
            width,
            height
        ))
    })?;

    RgbImage::from_raw(width, height, packed)
        .ok_or_else(|| CaptureError::Device("frame size mismatch".to_string()))
}

#[async_trait]
impl CameraDevice for GstCamera {
    async fn open(&mut self) -> Result<(), CaptureError> {
        let description = self.pipeline_description();
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let (pipeline, appsink) = tokio::task::spawn_blocking(move || launch(&description))
            .await
            .map_err(|e| CaptureError::CameraUnavailable(e.to_string()))??;

        info!(device = %self.device, "Camera opened");
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    async fn grab(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        let appsink = self
            .appsink
            .clone()
            .ok_or_else(|| CaptureError::Device("camera not open".to_string()))?;
        let timeout = gst::ClockTime::from_mseconds(self.grab_timeout.as_millis() as u64);

        tokio::task::spawn_blocking(move || {
            appsink
                .try_pull_sample(timeout)
                .map(|sample| frame_from_sample(&sample))
                .transpose()
        })
        .await
        .map_err(|e| CaptureError::Device(e.to_string()))?
    }

    fn close(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!(error = %e, "Failed to stop camera pipeline");
            }
            debug!(device = %self.device, "Camera closed");
        }
    }
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        self.close();
    }
}
