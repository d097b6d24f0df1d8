//! Handler error type and its mapping onto HTTP responses.

use alert_engine::store::Conflict;
use alert_engine::StatusUpdateError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::csv_import::CsvError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        ApiError::NotFound(format!("{entity} {id} not found"))
    }
}

/// Storage errors become 500s, except uniqueness violations which are the
/// caller's fault.
impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<Conflict>() {
            Some(conflict) => ApiError::BadRequest(conflict.0.clone()),
            None => ApiError::Internal(e),
        }
    }
}

impl From<StatusUpdateError> for ApiError {
    fn from(e: StatusUpdateError) -> Self {
        match e {
            StatusUpdateError::NotFound(id) => ApiError::not_found("alert", id),
            StatusUpdateError::Storage(e) => e.into(),
        }
    }
}

impl From<CsvError> for ApiError {
    fn from(e: CsvError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Internal(e) => {
                error!(error = %format!("{e:#}"), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "an internal error occurred".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_bad_request() {
        let e: ApiError = anyhow::Error::new(Conflict("floor 'Floor 1' already exists".into())).into();
        assert!(matches!(e, ApiError::BadRequest(ref m) if m.contains("Floor 1")));
        assert_eq!(e.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn other_storage_errors_are_internal() {
        let e: ApiError = anyhow::anyhow!("connection reset").into();
        assert_eq!(e.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn missing_alert_is_404() {
        let e: ApiError = StatusUpdateError::NotFound(7).into();
        assert_eq!(e.to_string(), "alert 7 not found");
        assert_eq!(e.into_response().status(), StatusCode::NOT_FOUND);
    }
}
