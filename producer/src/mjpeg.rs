use bytes::BytesMut;
use futures_util::StreamExt;
use image::ImageFormat;
use roi_inspect_common::frame::Frame;
use roi_inspect_common::status::{StatusLevel, StatusSink, CAMERA_UNAVAILABLE_MESSAGE};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::source::FramePublisher;
use crate::CaptureError;

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for a `multipart/x-mixed-replace` body using the
/// `--frame` boundary. Bytes may arrive in arbitrarily sized chunks.
#[derive(Debug)]
pub struct MultipartParser {
    buffer: BytesMut,
    state: ParseState,
    scan_from: usize,
}

impl Default for MultipartParser {
    fn default() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }
}

impl MultipartParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk and return every part body it completed.
    /// Empty parts are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the boundary spans chunks
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.scan_from = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let found = find_subsequence(&self.buffer[self.scan_from..], BOUNDARY);
                    if let Some(pos) = found {
                        let part_end = self.scan_from + pos;
                        // Strip the CRLF that precedes the boundary
                        let end = if self.buffer[..part_end].ends_with(b"\r\n") {
                            part_end - 2
                        } else {
                            part_end
                        };
                        if end > 0 {
                            parts.push(self.buffer[..end].to_vec());
                        }
                        let _ = self.buffer.split_to(part_end + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Avoid rescanning bytes already known not to start a boundary
                        self.scan_from = self.buffer.len().saturating_sub(BOUNDARY.len());
                        break;
                    }
                }
            }
        }

        parts
    }
}

/// Decode one JPEG part into a color frame.
pub fn decode_jpeg(data: &[u8]) -> Result<Frame, CaptureError> {
    let img = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map_err(CaptureError::Decode)?;
    Ok(Frame::Color(img.into_rgb8()))
}

/// Consume the MJPEG stream and publish decoded frames.
/// Reconnects with exponential backoff on failure; never returns.
pub async fn run_mjpeg_capture(
    stream_url: &str,
    publisher: &FramePublisher,
    status: &dyn StatusSink,
) -> Result<(), CaptureError> {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        info!(url = stream_url, "connecting to MJPEG stream");
        match consume_stream(stream_url, publisher, status).await {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
                status.report(CAMERA_UNAVAILABLE_MESSAGE, StatusLevel::Error);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

async fn consume_stream(
    url: &str,
    publisher: &FramePublisher,
    status: &dyn StatusSink,
) -> Result<(), CaptureError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(CaptureError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(CaptureError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(CaptureError::HttpStatus(response.status().as_u16()));
    }

    info!(status = %response.status(), "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MultipartParser::new();
    let mut announced = false;

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(CaptureError::HttpStream)?;
        for part in parser.push(&chunk) {
            match decode_jpeg(&part) {
                Ok(frame) => {
                    let (width, height) = frame.dimensions();
                    let seq = publisher.publish(frame);
                    debug!(seq, bytes = part.len(), width, height, "frame captured");
                    if !announced {
                        status.camera_ready();
                        announced = true;
                    }
                }
                Err(e) => warn!(error = %e, bytes = part.len(), "skipping undecodable part"),
            }
        }
    }

    Ok(())
}

/// Polling-based fallback: periodically fetch single frames.
pub async fn run_polling_capture(
    frame_url: &str,
    interval: Duration,
    publisher: &FramePublisher,
    status: &dyn StatusSink,
) -> Result<(), CaptureError> {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    let mut healthy = false;

    loop {
        ticker.tick().await;

        match fetch_frame(&client, frame_url).await {
            Ok(frame) => {
                let seq = publisher.publish(frame);
                debug!(seq, "frame polled");
                if !healthy {
                    status.camera_ready();
                    healthy = true;
                }
            }
            Err(CaptureError::Decode(e)) => {
                warn!(error = %e, "skipping undecodable frame");
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch camera frame");
                if healthy {
                    status.report(CAMERA_UNAVAILABLE_MESSAGE, StatusLevel::Error);
                    healthy = false;
                }
            }
        }
    }
}

async fn fetch_frame(client: &reqwest::Client, url: &str) -> Result<Frame, CaptureError> {
    let resp = client.get(url).send().await.map_err(CaptureError::HttpConnect)?;
    if !resp.status().is_success() {
        return Err(CaptureError::HttpStatus(resp.status().as_u16()));
    }
    let body = resp.bytes().await.map_err(CaptureError::HttpStream)?;
    decode_jpeg(&body)
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
