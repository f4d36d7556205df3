use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use bay_orchestrator::Error;

const MAX_DETAILS_BYTES: usize = 2048;

/// Boundary representation of the error taxonomy: one status per kind and
/// a `{code, message, details}` body with bounded details.
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Value,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            code: "validation",
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
            details: Value::Null,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let details = bound_details(self.details);
        let body = Json(json!({
            "code": self.code,
            "message": self.message,
            "details": details,
        }));
        (self.status, body).into_response()
    }
}

fn bound_details(details: Value) -> Value {
    match serde_json::to_string(&details) {
        Ok(s) if s.len() > MAX_DETAILS_BYTES => json!({ "truncated": true }),
        _ => details,
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let code = e.code();
        let (status, details) = match &e {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, Value::Null),
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, Value::Null),
            Error::Conflict(_) => (StatusCode::CONFLICT, Value::Null),
            Error::Validation(_) | Error::InvalidPath(_) => (StatusCode::BAD_REQUEST, Value::Null),
            Error::CapabilityNotSupported(cap) => {
                (StatusCode::BAD_REQUEST, json!({ "capability": cap.to_string() }))
            }
            Error::SandboxExpired(id) => (StatusCode::GONE, json!({ "sandbox_id": id.to_string() })),
            Error::SandboxTtlInfinite(id) => {
                (StatusCode::CONFLICT, json!({ "sandbox_id": id.to_string() }))
            }
            Error::SessionNotReady { sandbox_id, .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "sandbox_id": sandbox_id.to_string() }),
            ),
            Error::Runtime(_) => (StatusCode::BAD_GATEWAY, Value::Null),
            Error::Transient(_) | Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, Value::Null),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, Value::Null),
        };
        ApiError { status, code, message: e.to_string(), details }
    }
}

impl From<bay_store::StoreError> for ApiError {
    fn from(e: bay_store::StoreError) -> Self {
        ApiError::from(Error::from(e))
    }
}
