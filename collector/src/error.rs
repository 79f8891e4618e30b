use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("invalid prediction: {0}")]
    Invalid(String),
    #[error("failed to create database directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IntoResponse for CollectorError {
    fn into_response(self) -> Response {
        let status = match self {
            CollectorError::Invalid(_) => StatusCode::BAD_REQUEST,
            _ => {
                error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({ "status": "error", "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}
