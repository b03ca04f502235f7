use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use roi_inspect_common::config::Config;
use roi_inspect_common::frame::{ComparisonResult, Region};
use roi_inspect_common::status::{StatusLevel, StatusSink, CAMERA_UNAVAILABLE_MESSAGE};
use roi_inspect_engine::{Inspector, ReferenceStore};
use roi_inspect_producer::LatestFrame;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::ApiError;
use crate::status::{BoardSnapshot, StatusBoard};

const SELECT_ROI_MESSAGE: &str = "Select ROI by dragging mouse over the video.";
const ROI_SELECTED_MESSAGE: &str = "ROI selected. Ready to calibrate.";
const CALIBRATING_MESSAGE: &str = "Calibrating... please wait";
const CALIBRATED_MESSAGE: &str = "Calibration complete";
const CALIBRATION_FAILED_MESSAGE: &str = "Calibration failed";
const TESTING_MESSAGE: &str = "Testing...";
const RESET_MESSAGE: &str = "Reset done. Please select ROI again.";
const RECONNECTED_MESSAGE: &str = "Camera reconnected";

const ROI_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const OUTLINE_WIDTH: u32 = 2;

/// ROI as sent by the client: either a rectangle or the two corners of a drag.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RoiRequest {
    Corners { start: (u32, u32), end: (u32, u32) },
    Rect(Region),
}

impl RoiRequest {
    pub fn region(&self) -> Region {
        match *self {
            RoiRequest::Corners { start, end } => Region::from_corners(start, end),
            RoiRequest::Rect(region) => region,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub board: BoardSnapshot,
    pub roi: Option<Region>,
    pub frame_available: bool,
    pub frame_seq: Option<u64>,
    pub references_complete: bool,
    pub calibrating: bool,
}

/// Operator session: ROI selection, reference calibration and test cycles
/// against the live camera.
pub struct Session {
    latest: LatestFrame,
    board: Arc<StatusBoard>,
    store: Arc<ReferenceStore>,
    inspector: Inspector,
    capture_interval: Duration,
    roi: Mutex<Option<Region>>,
    calibrating: AtomicBool,
}

impl Session {
    pub fn new(
        latest: LatestFrame,
        board: Arc<StatusBoard>,
        store: ReferenceStore,
        inspector: Inspector,
        capture_interval: Duration,
    ) -> Self {
        Self {
            latest,
            board,
            store: Arc::new(store),
            inspector,
            capture_interval,
            roi: Mutex::new(None),
            calibrating: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config, latest: LatestFrame, board: Arc<StatusBoard>) -> Self {
        let inspector = Inspector::from_config(&config.normalizer, &config.detector);
        let store = ReferenceStore::from_config(&config.reference, *inspector.normalizer());
        Self::new(
            latest,
            board,
            store,
            inspector,
            Duration::from_millis(config.reference.capture_interval_ms),
        )
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    pub fn roi(&self) -> Option<Region> {
        *self.lock_roi()
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let frame = self.latest.snapshot();
        SessionSnapshot {
            board: self.board.snapshot(),
            roi: self.roi(),
            frame_available: frame.is_some(),
            frame_seq: frame.map(|f| f.seq),
            references_complete: self.store.is_complete(),
            calibrating: self.is_calibrating(),
        }
    }

    /// Set the ROI after checking it against the current frame size.
    pub fn select_roi(&self, request: RoiRequest) -> Result<Region, ApiError> {
        let region = request.region();
        let frame = self.latest.snapshot().ok_or(ApiError::NoFrame);
        let frame = frame.map_err(|e| self.fail(e))?;
        let (width, height) = frame.frame.dimensions();
        region.validate(width, height).map_err(|e| self.fail(e.into()))?;

        *self.lock_roi() = Some(region);
        info!(?region, "ROI selected");
        self.board.report(ROI_SELECTED_MESSAGE, StatusLevel::Warning);
        Ok(region)
    }

    pub fn clear_roi(&self) {
        *self.lock_roi() = None;
        self.board.clear_result();
        self.board.report(SELECT_ROI_MESSAGE, StatusLevel::Warning);
    }

    /// Start capturing the reference set in the background.
    ///
    /// Each slot takes a fresh crop of the latest frame, spaced by the
    /// configured capture interval. Only one calibration runs at a time.
    pub fn start_calibration(self: &Arc<Self>) -> Result<JoinHandle<()>, ApiError> {
        let roi = match (self.roi(), self.latest.snapshot()) {
            (Some(roi), Some(_)) => roi,
            _ => return Err(self.fail(ApiError::NoFrameOrRoi)),
        };
        if self
            .calibrating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.fail(ApiError::CalibrationRunning));
        }

        self.board.set_progress(0.0);
        self.board.clear_result();
        self.board.report(CALIBRATING_MESSAGE, StatusLevel::Warning);
        info!(?roi, count = self.store.count(), "calibration started");

        let session = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = CalibrationGuard(&session.calibrating);
            match session.capture_references(roi).await {
                Ok(()) => {
                    info!(dir = %session.store.dir().display(), "calibration complete");
                    session.board.report(CALIBRATED_MESSAGE, StatusLevel::Success);
                }
                Err(e) => {
                    error!(error = %e, "calibration failed");
                    session
                        .board
                        .report(CALIBRATION_FAILED_MESSAGE, StatusLevel::Error);
                }
            }
        }))
    }

    async fn capture_references(&self, roi: Region) -> Result<(), ApiError> {
        // A set only counts as complete once this pass has written every slot
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.clear()).await??;

        let count = self.store.count();
        for index in 0..count {
            let captured = self.latest.snapshot().ok_or(ApiError::NoFrame)?;
            let crop = captured.frame.crop(&roi)?;

            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || store.save(index, &crop)).await??;

            self.board.set_progress((index + 1) as f64 / count as f64);
            debug!(index, seq = captured.seq, "reference captured");
            tokio::time::sleep(self.capture_interval).await;
        }
        Ok(())
    }

    /// Run one test cycle on the latest frame and publish the verdict.
    pub async fn run_test(&self) -> Result<ComparisonResult, ApiError> {
        let Some(roi) = self.roi() else {
            return Err(self.fail(ApiError::NoRoi));
        };
        let missing = self.store.missing();
        if !missing.is_empty() {
            return Err(self.fail(ApiError::MissingReferences(missing)));
        }

        self.board.clear_result();
        self.board.report(TESTING_MESSAGE, StatusLevel::Warning);

        let captured = self.latest.snapshot().ok_or(ApiError::NoFrame);
        let captured = captured.map_err(|e| self.fail(e))?;
        let live = captured.frame.crop(&roi).map_err(|e| self.fail(e.into()))?;

        let inspector = self.inspector;
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || inspector.evaluate(live, store.as_ref()))
            .await?;

        info!(
            seq = captured.seq,
            verdict = ?result.verdict(),
            severity = format!("{:.4}", result.severity),
            "test cycle finished"
        );
        self.board.publish_result(&result);
        Ok(result)
    }

    pub fn reset(&self) {
        *self.lock_roi() = None;
        self.board.set_progress(0.0);
        self.board.clear_result();
        self.board.report(RESET_MESSAGE, StatusLevel::Neutral);
    }

    /// Latest frame as PNG, with the ROI outlined when one is set.
    pub fn frame_png(&self) -> Result<Vec<u8>, ApiError> {
        let captured = self.latest.snapshot().ok_or(ApiError::NoFrame)?;
        let mut img = captured.frame.clone().into_dynamic().into_rgb8();
        if let Some(roi) = self.roi() {
            draw_outline(&mut img, &roi);
        }

        let mut png = Vec::new();
        DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        Ok(png)
    }

    /// Report an error on the board and hand it back.
    fn fail(&self, err: ApiError) -> ApiError {
        debug!(error = %err, "request rejected");
        self.board.report(err.operator_message(), err.level());
        err
    }

    fn lock_roi(&self) -> MutexGuard<'_, Option<Region>> {
        self.roi.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Capture-side status goes through the session so a reconnect does not
/// overwrite the operator's current step.
impl StatusSink for Session {
    fn report(&self, message: &str, level: StatusLevel) {
        self.board.report(message, level);
    }

    fn camera_ready(&self) {
        if self.roi().is_none() {
            self.board.camera_ready();
        } else if self.board.snapshot().status.message == CAMERA_UNAVAILABLE_MESSAGE {
            self.board.report(RECONNECTED_MESSAGE, StatusLevel::Neutral);
        } else {
            debug!("camera ready, keeping current status");
        }
    }
}

/// Clears the calibration flag however the worker exits.
struct CalibrationGuard<'a>(&'a AtomicBool);

impl Drop for CalibrationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn draw_outline(img: &mut RgbImage, roi: &Region) {
    let right = roi.x.saturating_add(roi.width).min(img.width());
    let bottom = roi.y.saturating_add(roi.height).min(img.height());
    for y in roi.y..bottom {
        for x in roi.x..right {
            let on_edge = x < roi.x + OUTLINE_WIDTH
                || y < roi.y + OUTLINE_WIDTH
                || x + OUTLINE_WIDTH >= right
                || y + OUTLINE_WIDTH >= bottom;
            if on_edge {
                img.put_pixel(x, y, ROI_COLOR);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roi_inspect_common::frame::Frame;
    use roi_inspect_common::status::CAMERA_READY_MESSAGE;
    use roi_inspect_engine::ContrastNormalizer;
    use roi_inspect_producer::{channel, FramePublisher};
    use tempfile::tempdir;

    /// Session keeping its references under `dir`.
    fn test_session(dir: &std::path::Path, latest: LatestFrame, count: usize) -> Arc<Session> {
        let board = Arc::new(StatusBoard::new("", StatusLevel::Neutral));
        let store = ReferenceStore::new(dir, count, ContrastNormalizer::default());
        Arc::new(Session::new(
            latest,
            board,
            store,
            Inspector::default(),
            Duration::from_millis(1),
        ))
    }

    fn scene(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = ((x * 7 + y * 3) % 180) as u8 + 40;
            Rgb([v, v.wrapping_add(20), 255 - v])
        })
    }

    fn publish_scene(publisher: &FramePublisher) -> RgbImage {
        let img = scene(64, 48);
        publisher.publish(Frame::Color(img.clone()));
        img
    }

    fn status(session: &Session) -> (String, StatusLevel) {
        let snap = session.board().snapshot();
        (snap.status.message, snap.status.level)
    }

    #[test]
    fn roi_request_accepts_rect_or_corners() {
        let rect: RoiRequest =
            serde_json::from_str(r#"{"x":1,"y":2,"width":3,"height":4}"#).unwrap();
        assert_eq!(rect.region(), Region::new(1, 2, 3, 4));

        let corners: RoiRequest =
            serde_json::from_str(r#"{"start":[30,5],"end":[10,25]}"#).unwrap();
        assert_eq!(corners.region(), Region::new(10, 5, 20, 20));
    }

    #[test]
    fn roi_is_validated_against_latest_frame() {
        let dir = tempdir().unwrap();
        let (publisher, latest) = channel();
        let session = test_session(dir.path(), latest, 2);

        let request = RoiRequest::Rect(Region::new(0, 0, 10, 10));
        assert!(matches!(session.select_roi(request), Err(ApiError::NoFrame)));

        publish_scene(&publisher);
        let too_big = RoiRequest::Rect(Region::new(60, 0, 10, 10));
        assert!(matches!(session.select_roi(too_big), Err(ApiError::InvalidRoi(_))));
        let empty = RoiRequest::Corners {
            start: (5, 5),
            end: (5, 20),
        };
        assert!(matches!(session.select_roi(empty), Err(ApiError::InvalidRoi(_))));
        assert_eq!(session.roi(), None);

        session.select_roi(request).unwrap();
        assert_eq!(session.roi(), Some(Region::new(0, 0, 10, 10)));
        assert_eq!(
            status(&session),
            (ROI_SELECTED_MESSAGE.to_string(), StatusLevel::Warning)
        );

        session.clear_roi();
        assert_eq!(session.roi(), None);
        assert_eq!(status(&session).0, SELECT_ROI_MESSAGE);
    }

    #[tokio::test]
    async fn calibration_requires_frame_and_roi() {
        let dir = tempdir().unwrap();
        let (_publisher, latest) = channel();
        let session = test_session(dir.path(), latest, 2);

        assert!(matches!(session.start_calibration(), Err(ApiError::NoFrameOrRoi)));
        assert_eq!(
            status(&session),
            ("Status: No frame or ROI".to_string(), StatusLevel::Error)
        );
    }

    #[tokio::test]
    async fn test_requires_roi_and_complete_references() {
        let dir = tempdir().unwrap();
        let (publisher, latest) = channel();
        let session = test_session(dir.path(), latest, 3);

        assert!(matches!(session.run_test().await, Err(ApiError::NoRoi)));
        assert_eq!(status(&session).0, "No ROI selected");

        publish_scene(&publisher);
        session
            .select_roi(RoiRequest::Rect(Region::new(4, 4, 20, 20)))
            .unwrap();
        match session.run_test().await {
            Err(ApiError::MissingReferences(missing)) => assert_eq!(missing, vec![0, 1, 2]),
            other => panic!("expected missing references, got {other:?}"),
        }
        assert_eq!(
            status(&session),
            ("Missing reference images".to_string(), StatusLevel::Error)
        );
    }

    #[tokio::test]
    async fn calibrate_then_test_pass_and_fail() {
        let dir = tempdir().unwrap();
        let (publisher, latest) = channel();
        let session = test_session(&dir.path().join("reference"), latest, 3);

        let img = publish_scene(&publisher);
        let roi = Region::new(8, 8, 32, 24);
        session.select_roi(RoiRequest::Rect(roi)).unwrap();

        session.start_calibration().unwrap().await.unwrap();
        let snap = session.snapshot();
        assert!(snap.references_complete);
        assert!(!snap.calibrating);
        assert_eq!(snap.board.progress, 1.0);
        assert_eq!(
            (snap.board.status.message, snap.board.status.level),
            (CALIBRATED_MESSAGE.to_string(), StatusLevel::Success)
        );

        let result = session.run_test().await.unwrap();
        assert!(!result.changed);
        assert_eq!(result.severity, 0.0);
        let shown = session.board().snapshot().result.unwrap();
        assert_eq!(shown.text, "PASS (Diff=0.00%)");

        let mut altered = img;
        for y in 12..28 {
            for x in 14..30 {
                altered.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        publisher.publish(Frame::Color(altered));
        let result = session.run_test().await.unwrap();
        assert!(result.changed);
        let shown = session.board().snapshot().result.unwrap();
        assert!(shown.text.starts_with("FAIL (Diff="));
        assert_eq!(shown.level, StatusLevel::Error);
    }

    #[tokio::test]
    async fn second_calibration_is_rejected_while_running() {
        let dir = tempdir().unwrap();
        let (publisher, latest) = channel();
        let session = test_session(dir.path(), latest, 2);
        publish_scene(&publisher);
        session
            .select_roi(RoiRequest::Rect(Region::new(0, 0, 16, 16)))
            .unwrap();

        let handle = session.start_calibration().unwrap();
        assert!(session.is_calibrating());
        assert!(matches!(session.start_calibration(), Err(ApiError::CalibrationRunning)));

        handle.await.unwrap();
        assert!(!session.is_calibrating());
        assert!(session.start_calibration().unwrap().await.is_ok());
    }

    #[tokio::test]
    async fn aborted_recalibration_leaves_no_stale_references() {
        let dir = tempdir().unwrap();
        let (publisher, latest) = channel();
        let session = test_session(dir.path(), latest, 3);
        publish_scene(&publisher);
        session
            .select_roi(RoiRequest::Rect(Region::new(8, 8, 32, 24)))
            .unwrap();
        session.start_calibration().unwrap().await.unwrap();
        assert!(session.snapshot().references_complete);

        let handle = session.start_calibration().unwrap();
        // The worker has not run yet; a frame too small for the ROI makes it abort.
        publisher.publish(Frame::Color(scene(16, 16)));
        handle.await.unwrap();

        let snap = session.snapshot();
        assert!(!snap.references_complete);
        assert!(!snap.calibrating);
        assert_eq!(
            (snap.board.status.message, snap.board.status.level),
            (CALIBRATION_FAILED_MESSAGE.to_string(), StatusLevel::Error)
        );
        match session.run_test().await {
            Err(ApiError::MissingReferences(missing)) => assert_eq!(missing, vec![0, 1, 2]),
            other => panic!("expected missing references, got {other:?}"),
        }
    }

    #[test]
    fn camera_ready_prompts_only_without_roi() {
        let dir = tempdir().unwrap();
        let (publisher, latest) = channel();
        let session = test_session(dir.path(), latest, 1);
        publish_scene(&publisher);

        session.camera_ready();
        assert_eq!(
            status(&session),
            (CAMERA_READY_MESSAGE.to_string(), StatusLevel::Neutral)
        );

        session
            .select_roi(RoiRequest::Rect(Region::new(8, 8, 32, 24)))
            .unwrap();
        session.camera_ready();
        assert_eq!(
            status(&session),
            (ROI_SELECTED_MESSAGE.to_string(), StatusLevel::Warning)
        );

        session.report(CAMERA_UNAVAILABLE_MESSAGE, StatusLevel::Error);
        session.camera_ready();
        assert_eq!(
            status(&session),
            (RECONNECTED_MESSAGE.to_string(), StatusLevel::Neutral)
        );
        assert_eq!(session.roi(), Some(Region::new(8, 8, 32, 24)));
    }

    #[tokio::test]
    async fn reset_clears_roi_and_result() {
        let dir = tempdir().unwrap();
        let (publisher, latest) = channel();
        let session = test_session(dir.path(), latest, 1);
        publish_scene(&publisher);
        session
            .select_roi(RoiRequest::Rect(Region::new(0, 0, 16, 16)))
            .unwrap();
        session.start_calibration().unwrap().await.unwrap();
        session.run_test().await.unwrap();
        assert!(session.board().snapshot().result.is_some());

        session.reset();
        let snap = session.snapshot();
        assert_eq!(snap.roi, None);
        assert!(snap.board.result.is_none());
        assert_eq!(snap.board.status.message, RESET_MESSAGE);
        assert_eq!(snap.board.status.level, StatusLevel::Neutral);
        // References survive a reset
        assert!(snap.references_complete);
    }

    #[test]
    fn frame_png_outlines_roi() {
        let dir = tempdir().unwrap();
        let (publisher, latest) = channel();
        let session = test_session(dir.path(), latest, 1);
        assert!(matches!(session.frame_png(), Err(ApiError::NoFrame)));

        let img = publish_scene(&publisher);
        session
            .select_roi(RoiRequest::Rect(Region::new(10, 10, 20, 12)))
            .unwrap();
        let png = session.frame_png().unwrap();
        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png)
            .unwrap()
            .into_rgb8();

        assert_eq!(decoded.dimensions(), (64, 48));
        assert_eq!(*decoded.get_pixel(10, 10), ROI_COLOR);
        assert_eq!(*decoded.get_pixel(29, 21), ROI_COLOR);
        assert_eq!(*decoded.get_pixel(11, 15), ROI_COLOR);
        assert_eq!(decoded.get_pixel(20, 16), img.get_pixel(20, 16));
        assert_eq!(decoded.get_pixel(0, 0), img.get_pixel(0, 0));
    }
}
