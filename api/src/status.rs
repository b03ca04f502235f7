use chrono::Utc;
use roi_inspect_common::frame::{ComparisonResult, Verdict};
use roi_inspect_common::status::{StatusLevel, StatusSink};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusLine {
    pub message: String,
    pub level: StatusLevel,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultLine {
    pub text: String,
    pub level: StatusLevel,
    pub verdict: Verdict,
    pub severity: f64,
}

/// Point-in-time copy of everything the operator sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardSnapshot {
    pub status: StatusLine,
    pub result: Option<ResultLine>,
    /// Calibration progress in [0, 1].
    pub progress: f64,
}

/// Shared operator display: one status line, one result line and a
/// calibration progress bar. Written from handlers and background tasks.
pub struct StatusBoard {
    inner: Mutex<BoardSnapshot>,
}

impl StatusBoard {
    pub fn new(message: &str, level: StatusLevel) -> Self {
        Self {
            inner: Mutex::new(BoardSnapshot {
                status: line(message, level),
                result: None,
                progress: 0.0,
            }),
        }
    }

    pub fn publish_result(&self, result: &ComparisonResult) {
        let level = match result.verdict() {
            Verdict::Pass => StatusLevel::Success,
            Verdict::Fail => StatusLevel::Error,
        };
        self.lock().result = Some(ResultLine {
            text: result.summary(),
            level,
            verdict: result.verdict(),
            severity: result.severity,
        });
    }

    pub fn clear_result(&self) {
        self.lock().result = None;
    }

    pub fn set_progress(&self, progress: f64) {
        self.lock().progress = progress.clamp(0.0, 1.0);
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BoardSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StatusSink for StatusBoard {
    fn report(&self, message: &str, level: StatusLevel) {
        info!(text = message, level = ?level, "status updated");
        self.lock().status = line(message, level);
    }
}

fn line(message: &str, level: StatusLevel) -> StatusLine {
    StatusLine {
        message: message.to_string(),
        level,
        updated_at_ms: Utc::now().timestamp_millis(),
    }
}
