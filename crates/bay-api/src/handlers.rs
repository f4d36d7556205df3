use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bay_domain::{Capability, CargoId, OwnerId, ProfileId, SandboxId};
use bay_gc::GcTask;
use bay_orchestrator::{
    with_idempotency, CapabilityRequest, Error, StoredResponse,
};
use bay_store::{request_fingerprint, SandboxQuery};
use serde_json::{json, Value};

use crate::dto::{
    CargoView, CreateCargoBody, CreateSandboxBody, ExtendTtlBody, GcRunBody,
    ListSandboxesQuery, ProfileView, SandboxView,
};
use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn idempotency_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("idempotency-key").and_then(|v| v.to_str().ok())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::validation(format!("malformed body: {e}")))
}

fn json_response(response: StoredResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        response.body,
    )
        .into_response()
}

fn encode<T: serde::Serialize>(status: u16, value: &T) -> Result<StoredResponse, Error> {
    let body = serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("response encoding: {e}")))?;
    Ok(StoredResponse { status, body })
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── Sandboxes ─────────────────────────────────────────────────────────────────

pub async fn create_sandbox(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CreateSandboxBody = parse_body(&body)?;
    let fingerprint = request_fingerprint("POST", "/v1/sandboxes", &body);

    let response = with_idempotency(
        &state.store,
        &owner,
        idempotency_key(&headers),
        &fingerprint,
        state.idempotency_retention,
        || async {
            let sandbox = state
                .sandboxes
                .create(
                    &owner,
                    &ProfileId::new(&request.profile_id),
                    request.cargo_id.as_ref().map(CargoId::new).as_ref(),
                    request.ttl_seconds,
                )
                .await?;
            encode(201, &SandboxView::from(&sandbox))
        },
    )
    .await?;
    Ok(json_response(response))
}

pub async fn list_sandboxes(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Query(query): Query<ListSandboxesQuery>,
) -> Result<Json<Value>, ApiError> {
    let sandboxes = state
        .sandboxes
        .list(
            &owner,
            &SandboxQuery {
                cursor: query.cursor.map(SandboxId::new),
                limit: query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE),
                profile_id: query.profile_id.map(ProfileId::new),
            },
        )
        .await
        .map_err(ApiError::from)?;
    let items: Vec<SandboxView> = sandboxes.iter().map(SandboxView::from).collect();
    let next_cursor = items.last().map(|s| s.id.clone());
    Ok(Json(json!({ "sandboxes": items, "next_cursor": next_cursor })))
}

pub async fn get_sandbox(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<Json<SandboxView>, ApiError> {
    let sandbox = state
        .sandboxes
        .get(&owner, &SandboxId::new(id))
        .await
        .map_err(ApiError::from)?;
    Ok(Json(SandboxView::from(&sandbox)))
}

pub async fn delete_sandbox(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .sandboxes
        .delete(&owner, &SandboxId::new(&id))
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "deleted": id })))
}

pub async fn stop_sandbox(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<Json<SandboxView>, ApiError> {
    let sandbox = state
        .sandboxes
        .stop(&owner, &SandboxId::new(id))
        .await
        .map_err(ApiError::from)?;
    Ok(Json(SandboxView::from(&sandbox)))
}

pub async fn keepalive_sandbox(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<Json<SandboxView>, ApiError> {
    let sandbox = state
        .sandboxes
        .keepalive(&owner, &SandboxId::new(id))
        .await
        .map_err(ApiError::from)?;
    Ok(Json(SandboxView::from(&sandbox)))
}

pub async fn extend_ttl(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ExtendTtlBody = parse_body(&body)?;
    let path = format!("/v1/sandboxes/{id}/extend_ttl");
    let fingerprint = request_fingerprint("POST", &path, &body);
    let sandbox_id = SandboxId::new(id);

    let response = with_idempotency(
        &state.store,
        &owner,
        idempotency_key(&headers),
        &fingerprint,
        state.idempotency_retention,
        || async {
            let sandbox = state
                .sandboxes
                .extend_ttl(&owner, &sandbox_id, request.seconds)
                .await?;
            encode(200, &SandboxView::from(&sandbox))
        },
    )
    .await?;
    Ok(json_response(response))
}

// ── Capability dispatch ───────────────────────────────────────────────────────

pub async fn invoke_capability(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path((id, capability, operation)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let capability = Capability::parse(&capability)
        .ok_or_else(|| ApiError::validation(format!("unknown capability '{capability}'")))?;
    let payload: Value = if body.is_empty() {
        json!({})
    } else {
        parse_body(&body)?
    };
    let timeout = payload
        .get("timeout_seconds")
        .and_then(Value::as_u64)
        .map(Duration::from_secs);

    let result = state
        .router
        .invoke(
            &owner,
            &SandboxId::new(id),
            CapabilityRequest { capability, operation, payload, timeout },
        )
        .await
        .map_err(ApiError::from)?;
    Ok(Json(result))
}

// ── Cargos ────────────────────────────────────────────────────────────────────

pub async fn create_cargo(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CreateCargoBody = if body.is_empty() {
        CreateCargoBody::default()
    } else {
        parse_body(&body)?
    };
    let fingerprint = request_fingerprint("POST", "/v1/cargos", &body);

    let response = with_idempotency(
        &state.store,
        &owner,
        idempotency_key(&headers),
        &fingerprint,
        state.idempotency_retention,
        || async {
            let cargo = state
                .cargos
                .create_external(&owner, request.size_limit_mb)
                .await?;
            encode(201, &CargoView::from(&cargo))
        },
    )
    .await?;
    Ok(json_response(response))
}

pub async fn list_cargos(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
) -> Result<Json<Value>, ApiError> {
    let cargos = state.cargos.list(&owner).await.map_err(ApiError::from)?;
    let items: Vec<CargoView> = cargos.iter().map(CargoView::from).collect();
    Ok(Json(json!({ "cargos": items })))
}

pub async fn get_cargo(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<Json<CargoView>, ApiError> {
    let cargo = state
        .cargos
        .get(&owner, &CargoId::new(id))
        .await
        .map_err(ApiError::from)?;
    Ok(Json(CargoView::from(&cargo)))
}

pub async fn delete_cargo(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .cargos
        .delete(&owner, &CargoId::new(&id))
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "deleted": id })))
}

// ── Profiles ──────────────────────────────────────────────────────────────────

pub async fn list_profiles(State(state): State<AppState>) -> Json<Value> {
    let profiles: Vec<ProfileView> =
        state.registry.all().iter().map(ProfileView::from).collect();
    Json(json!({ "profiles": profiles }))
}

// ── Admin ─────────────────────────────────────────────────────────────────────

pub async fn gc_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.gc.status().await))
}

pub async fn gc_run(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: GcRunBody = if body.is_empty() {
        GcRunBody::default()
    } else {
        parse_body(&body)?
    };
    match request.task {
        Some(name) => {
            let task = GcTask::parse(&name)
                .ok_or_else(|| ApiError::validation(format!("unknown gc task '{name}'")))?;
            let report = state.gc.run_task(task).await;
            Ok(Json(json!(report)))
        }
        None => {
            let status = state.gc.run_cycle().await;
            Ok(Json(json!(status)))
        }
    }
}
