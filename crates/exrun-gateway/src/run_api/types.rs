//! Response envelope and API error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use exrun_runs::RunServiceError;

pub(super) const OK_CODE: &str = "ok";

/// Wraps a payload as `{code:"ok", msg:"ok", data}`.
pub(super) fn ok_envelope(data: Value) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "code": OK_CODE, "msg": "ok", "data": data })),
    )
        .into_response()
}

#[derive(Debug)]
pub(super) struct RunApiError {
    pub(super) status: StatusCode,
    pub(super) code: &'static str,
    pub(super) message: String,
}

impl RunApiError {
    pub(super) fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub(super) fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(super) fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub(super) fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }
}

impl From<RunServiceError> for RunApiError {
    fn from(error: RunServiceError) -> Self {
        let code = error.code();
        let message = error.to_string();
        match error {
            RunServiceError::InvalidInput(_) => Self::bad_request(code, message),
            RunServiceError::NotFound(_) => Self::not_found(code, message),
            RunServiceError::Busy(_)
            | RunServiceError::NotRunning { .. }
            | RunServiceError::RuntimeNotReady(_) => Self::conflict(code, message),
        }
    }
}

impl IntoResponse for RunApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "code": self.code,
                "msg": self.message,
                "data": Value::Null,
            })),
        )
            .into_response()
    }
}
