use chrono::Utc;
use roi_inspect_common::frame::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// A decoded camera frame with capture metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub frame: Frame,
    /// Unix millis at the moment the frame was decoded.
    pub captured_at_ms: i64,
    /// Monotonic sequence number, per publisher.
    pub seq: u64,
}

/// Pull-style access to camera frames.
pub trait FrameSource {
    /// Newest frame not yet returned by this handle, or `None` if nothing new
    /// has arrived. Never blocks.
    fn get_next_frame(&mut self) -> Option<Arc<CapturedFrame>>;
}

/// Create a connected publisher / latest-frame pair.
pub fn channel() -> (FramePublisher, LatestFrame) {
    let (tx, rx) = watch::channel(None);
    (
        FramePublisher {
            tx,
            seq: AtomicU64::new(0),
        },
        LatestFrame { rx },
    )
}

/// Capture-side half: replaces the current frame with each new one.
pub struct FramePublisher {
    tx: watch::Sender<Option<Arc<CapturedFrame>>>,
    seq: AtomicU64,
}

impl FramePublisher {
    pub fn publish(&self, frame: Frame) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let captured = CapturedFrame {
            frame,
            captured_at_ms: Utc::now().timestamp_millis(),
            seq,
        };
        self.tx.send_replace(Some(Arc::new(captured)));
        seq
    }

    pub fn subscribe(&self) -> LatestFrame {
        LatestFrame {
            rx: self.tx.subscribe(),
        }
    }
}

/// Consumer-side half. Frames are shared immutably, so a holder never sees a
/// buffer the capture loop is still writing.
#[derive(Clone)]
pub struct LatestFrame {
    rx: watch::Receiver<Option<Arc<CapturedFrame>>>,
}

impl LatestFrame {
    /// The current frame, whether or not it was seen before.
    pub fn snapshot(&self) -> Option<Arc<CapturedFrame>> {
        self.rx.borrow().clone()
    }
}

impl FrameSource for LatestFrame {
    fn get_next_frame(&mut self) -> Option<Arc<CapturedFrame>> {
        match self.rx.has_changed() {
            Ok(true) => self.rx.borrow_and_update().clone(),
            _ => None,
        }
    }
}
