//! Error types and handling
//!
//! The normalized error taxonomy the session layer reports to the UI.
//! Backend and recorder errors are converted into [`SessionError`] before
//! they leave the controller; the UI only ever sees [`ErrorResponse`].

use crate::capture::CaptureError;
use crate::recorder::RecorderError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Session-level error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Recorder init error: {0}")]
    RecorderInit(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Flush error: {0}")]
    Flush(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Capture worker did not stop within {0:?}")]
    StopTimeout(Duration),
}

impl SessionError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Stable code used by the UI layer
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            SessionError::RecorderInit(_) => "RECORDER_INIT_ERROR",
            SessionError::Read(_) => "READ_ERROR",
            SessionError::Write(_) => "WRITE_ERROR",
            SessionError::Flush(_) => "FLUSH_ERROR",
            SessionError::InvalidState(_) => "INVALID_STATE",
            SessionError::StopTimeout(_) => "STOP_TIMEOUT",
        }
    }
}

impl From<CaptureError> for SessionError {
    fn from(error: CaptureError) -> Self {
        match error {
            CaptureError::BackendUnavailable(msg) => SessionError::BackendUnavailable(msg),
            CaptureError::EndOfStream => SessionError::Read("capture stream ended".to_string()),
            CaptureError::Read(msg) => SessionError::Read(msg),
            CaptureError::InvalidState(msg) => SessionError::InvalidState(msg),
        }
    }
}

impl From<RecorderError> for SessionError {
    fn from(error: RecorderError) -> Self {
        match error {
            RecorderError::Init(msg) => SessionError::RecorderInit(msg),
            RecorderError::Write(msg) => SessionError::Write(msg),
            RecorderError::Flush(msg) => SessionError::Flush(msg),
            RecorderError::InvalidState(msg) => SessionError::InvalidState(msg),
        }
    }
}

/// Error response for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<SessionError> for ErrorResponse {
    fn from(error: SessionError) -> Self {
        ErrorResponse::from(&error)
    }
}

impl From<&SessionError> for ErrorResponse {
    fn from(error: &SessionError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using SessionError
pub type SessionResult<T> = Result<T, SessionError>;
