use serde::{Deserialize, Serialize};

/// Color cue attached to every operator-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    #[default]
    Neutral,
    Warning,
    Error,
    Success,
}

/// Receiver for short status messages shown to the operator.
///
/// Implementations must be cheap and non-blocking: the capture loop calls
/// `report` from its own task.
pub trait StatusSink: Send + Sync {
    fn report(&self, message: &str, level: StatusLevel);

    /// Called once per (re)connect, on the first decoded frame.
    fn camera_ready(&self) {
        self.report(CAMERA_READY_MESSAGE, StatusLevel::Neutral);
    }
}

pub const CAMERA_READY_MESSAGE: &str = "Camera Ready. Please select ROI.";
pub const CAMERA_UNAVAILABLE_MESSAGE: &str = "Camera unavailable, retrying";
