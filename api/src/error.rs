use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use roi_inspect_common::frame::FrameError;
use roi_inspect_common::status::StatusLevel;
use roi_inspect_engine::ReferenceError;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no frame or ROI available for calibration")]
    NoFrameOrRoi,
    #[error("no ROI selected")]
    NoRoi,
    #[error("no camera frame available")]
    NoFrame,
    #[error("reference set incomplete, missing {0:?}")]
    MissingReferences(Vec<usize>),
    #[error("calibration already running")]
    CalibrationRunning,
    #[error("invalid ROI: {0}")]
    InvalidRoi(#[from] FrameError),
    #[error("reference storage: {0}")]
    Reference(#[from] ReferenceError),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("background task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl ApiError {
    /// Short text shown to the operator. Details stay in the log.
    pub fn operator_message(&self) -> &'static str {
        match self {
            ApiError::NoFrameOrRoi => "Status: No frame or ROI",
            ApiError::NoRoi => "No ROI selected",
            ApiError::NoFrame => "No camera frame available",
            ApiError::MissingReferences(_) => "Missing reference images",
            ApiError::CalibrationRunning => "Calibrating... please wait",
            ApiError::InvalidRoi(_) => "Invalid ROI, please select again",
            ApiError::Reference(_) => "Reference storage error",
            ApiError::Encode(_) | ApiError::Worker(_) => "Internal error",
        }
    }

    pub fn level(&self) -> StatusLevel {
        match self {
            ApiError::CalibrationRunning => StatusLevel::Warning,
            _ => StatusLevel::Error,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NoFrameOrRoi
            | ApiError::NoRoi
            | ApiError::NoFrame
            | ApiError::MissingReferences(_)
            | ApiError::CalibrationRunning => StatusCode::CONFLICT,
            ApiError::InvalidRoi(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Reference(_) | ApiError::Encode(_) | ApiError::Worker(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = serde_json::json!({
            "error": self.operator_message(),
            "level": self.level(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_failures_are_conflicts() {
        assert_eq!(ApiError::NoRoi.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::MissingReferences(vec![3]).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError::NoRoi.operator_message(), "No ROI selected");
    }

    #[test]
    fn invalid_roi_is_unprocessable() {
        let err = ApiError::from(FrameError::EmptyRegion {
            width: 0,
            height: 4,
        });
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn operator_message_hides_internal_detail() {
        let err = ApiError::Reference(ReferenceError::Incomplete { missing: vec![1, 2] });
        assert_eq!(err.operator_message(), "Reference storage error");
        assert!(err.to_string().contains("[1, 2]"));
    }
}
