// HTTP request handlers for the batch control surface.
//
// Caller identity arrives in the x-owner-id header; the authentication
// provider that put it there is someone else's problem. Illegal control
// transitions come back 200 with outcome "not_applicable" - they are no-ops,
// not errors.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use cvsift_core::ItemStatus;
use cvsift_engine::{ControlAction, SourceFile};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct CreateBatchRequest {
    job_description: String,
    files: Vec<FileUpload>,
}

#[derive(Debug, Deserialize)]
struct FileUpload {
    filename: String,
    content_b64: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ControlRequest {
    action: ControlAction,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ItemsQuery {
    status: Option<String>,
}

fn owner_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request(anyhow::anyhow!("x-owner-id header required")))
}

/// POST /v1/batches - create a batch from uploaded files
pub(crate) async fn create_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateBatchRequest>,
) -> Result<Response, AppError> {
    let owner = owner_id(&headers)?;
    counter!("cvsift.batches.create_requests", 1);

    debug!(
        owner,
        files = request.files.len(),
        "create batch request"
    );

    let mut files = Vec::with_capacity(request.files.len());
    for upload in request.files {
        let bytes = B64.decode(upload.content_b64.as_bytes()).map_err(|e| {
            AppError::bad_request(anyhow::anyhow!(
                "file {} is not valid base64: {}",
                upload.filename,
                e
            ))
        })?;
        files.push(SourceFile {
            filename: upload.filename,
            bytes,
        });
    }

    let receipt = state
        .engine
        .create_batch(&owner, &request.job_description, files)
        .await?;

    counter!("cvsift.batches.created", 1);
    Ok((StatusCode::CREATED, Json(receipt)).into_response())
}

/// POST /v1/batches/:id/control - pause | resume | cancel
pub(crate) async fn control_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ControlRequest>,
) -> Result<Response, AppError> {
    let owner = owner_id(&headers)?;
    counter!("cvsift.batches.control_requests", 1);

    let outcome = state
        .engine
        .control_batch(&owner, &batch_id, request.action)
        .await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "batch_id": batch_id,
            "action": request.action.as_str(),
            "outcome": outcome,
        })),
    )
        .into_response())
}

/// GET /v1/batches/:id - authoritative batch snapshot
pub(crate) async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let owner = owner_id(&headers)?;
    let batch = state.engine.get_batch(&owner, &batch_id).await?;
    Ok((StatusCode::OK, Json(batch)).into_response())
}

/// GET /v1/batches/:id/items?status= - item snapshots
pub(crate) async fn list_items(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Query(query): Query<ItemsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let owner = owner_id(&headers)?;

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            raw.parse::<ItemStatus>()
                .map_err(|e| AppError::bad_request(anyhow::anyhow!(e)))?,
        ),
    };

    let items = state.engine.list_items(&owner, &batch_id, status).await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "batch_id": batch_id,
            "items": items,
        })),
    )
        .into_response())
}

/// DELETE /v1/batches/:id - teardown a settled batch
pub(crate) async fn teardown_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let owner = owner_id(&headers)?;
    state.engine.teardown_batch(&owner, &batch_id).await?;
    counter!("cvsift.batches.torn_down", 1);
    Ok((StatusCode::OK, Json(json!({"status": "ok"}))).into_response())
}

/// GET /health - basic liveness check
pub(crate) async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

/// GET /ready - readiness check (object storage reachable)
pub(crate) async fn ready_check(State(state): State<AppState>) -> Result<Response, AppError> {
    state
        .engine
        .object_store()
        .check()
        .await
        .map_err(|e| AppError::with_status(StatusCode::BAD_GATEWAY, anyhow::anyhow!(e)))?;
    Ok((StatusCode::OK, Json(json!({"status": "ready"}))).into_response())
}
