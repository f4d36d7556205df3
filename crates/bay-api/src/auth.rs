use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use bay_domain::OwnerId;
use serde_json::json;

use crate::state::AppState;

/// Single-tenant deployments resolve the configured token to this
/// principal. Ownership still flows through every manager call, so a
/// multi-token resolver slots in here without touching the core.
pub const DEFAULT_OWNER: &str = "default";

/// Axum middleware requiring `Authorization: Bearer <token>` on every
/// route it covers. The resolved owner is attached as a request extension.
pub async fn require_bearer_token(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == state.auth_token.as_str() => {
            request.extensions_mut().insert(OwnerId::new(DEFAULT_OWNER));
            next.run(request).await
        }
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "code": "unauthorized",
                "message": "missing or invalid bearer token",
                "details": null,
            })),
        )
            .into_response(),
    }
}
