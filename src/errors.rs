use crate::services::{backend::BackendError, planner::PlanError, storage_service::StorageError};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Errors surfaced by an offset write.
#[derive(Debug, Error)]
pub enum WriteError {
    /// A copy part's range is empty or inverted. Raised before any I/O.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("direct part {part} cannot be rewound for checksumming")]
    SourceNotSeekable { part: usize },

    #[error("reading {} failed: {source}", describe_part(.part))]
    ReadFailure {
        part: Option<usize>,
        #[source]
        source: io::Error,
    },

    #[error("sending {} failed: {source}", describe_part(.part))]
    TransportFailure {
        part: Option<usize>,
        #[source]
        source: reqwest::Error,
    },

    #[error("backend rejected the write ({status}): {message}")]
    ComposeRejected { status: u16, message: String },

    #[error("object `{0}` not found")]
    NotFound(String),

    #[error("invalid write: {0}")]
    InvalidWrite(#[from] PlanError),

    #[error("malformed backend response: {0}")]
    MalformedResponse(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(BackendError),
}

fn describe_part(part: &Option<usize>) -> String {
    match part {
        Some(index) => format!("direct part {}", index),
        None => "request".to_string(),
    }
}

impl From<BackendError> for WriteError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(key) => WriteError::NotFound(key),
            BackendError::Status { status, message } => {
                WriteError::ComposeRejected { status, message }
            }
            other => WriteError::Backend(other),
        }
    }
}

/// A lightweight wrapper for HTTP-facing errors of the reference backend.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::ObjectNotFound { .. } => StatusCode::NOT_FOUND,
            StorageError::InvalidBucketName { .. }
            | StorageError::InvalidObjectKey
            | StorageError::MissingAttachment(_)
            | StorageError::ChecksumMismatch { .. } => StatusCode::BAD_REQUEST,
            StorageError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            StorageError::Sqlx(_) | StorageError::Io(_) => {
                tracing::error!("storage failure: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}
