//! Camera frame source: pulls JPEG frames from an HTTP camera and keeps the
//! newest decoded frame available to any number of readers.

mod mjpeg;
pub mod source;

use roi_inspect_common::config::CameraConfig;
use roi_inspect_common::status::{StatusLevel, StatusSink};
use std::time::Duration;
use tracing::{error, info};

pub use mjpeg::{decode_jpeg, MultipartParser};
pub use source::{channel, CapturedFrame, FramePublisher, FrameSource, LatestFrame};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("failed to decode frame: {0}")]
    Decode(image::ImageError),
    #[error("unknown capture mode '{0}', expected 'mjpeg' or 'polling'")]
    UnknownMode(String),
    #[error("capture rate {0} fps gives no usable polling period")]
    InvalidRate(f64),
}

/// Polling period for `fps`, or `None` when it would be non-finite or under 1 ms.
pub fn polling_interval(fps: f64) -> Option<Duration> {
    let period = 1.0 / fps;
    (period.is_finite() && period >= 1e-3).then(|| Duration::from_secs_f64(period))
}

/// Stream URL with quality and rate hints appended.
pub fn stream_url(config: &CameraConfig) -> String {
    format!("{}?quality={}&fps={}", config.url, config.quality, config.fps)
}

/// Single-frame URL derived from the stream URL.
pub fn frame_url(config: &CameraConfig) -> String {
    format!(
        "{}?quality={}",
        config.url.replace("/stream", "/frame"),
        config.quality
    )
}

/// Run the capture loop selected by `config.mode` until the task is dropped.
///
/// Only returns for a configuration error; connection failures are retried.
pub async fn run_capture(
    config: &CameraConfig,
    publisher: FramePublisher,
    status: &dyn StatusSink,
) -> Result<(), CaptureError> {
    info!(url = config.url, mode = config.mode, fps = config.fps, "starting frame capture");

    match config.mode.as_str() {
        "mjpeg" => mjpeg::run_mjpeg_capture(&stream_url(config), &publisher, status).await,
        "polling" => {
            let Some(interval) = polling_interval(config.fps) else {
                error!(fps = config.fps, "invalid polling rate");
                status.report(CONFIG_ERROR_MESSAGE, StatusLevel::Error);
                return Err(CaptureError::InvalidRate(config.fps));
            };
            mjpeg::run_polling_capture(&frame_url(config), interval, &publisher, status).await
        }
        other => {
            error!(mode = other, "unknown stream mode");
            status.report(CONFIG_ERROR_MESSAGE, StatusLevel::Error);
            Err(CaptureError::UnknownMode(other.to_string()))
        }
    }
}

const CONFIG_ERROR_MESSAGE: &str = "Camera configuration error";
