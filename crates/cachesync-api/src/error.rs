//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use cachesync_engine::Error as EngineError;
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("unavailable: {0}")]
  Unavailable(String),

  #[error(transparent)]
  Engine(#[from] EngineError),
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = match &self {
      ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
      ApiError::Engine(EngineError::UntrackedTable(_)) => StatusCode::NOT_FOUND,
      ApiError::Engine(EngineError::BackendUnavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
      ApiError::Engine(EngineError::Source(_)) => StatusCode::BAD_GATEWAY,
      ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
      tracing::warn!(error = %self, "api request failed");
    }
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}
