use super::ServerState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use cairn_core::operations::{FsckOperation, FsckOperationRequest};
use cairn_core::{CairnError, PREV_NODE_HEADER, is_valid_oid};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

fn ok_json<T: Serialize>(data: T) -> Response {
    let resp = ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    };
    (StatusCode::OK, axum::Json(resp)).into_response()
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.to_string()),
    };
    (status, axum::Json(resp)).into_response()
}

fn status_for(error: &CairnError) -> StatusCode {
    match error {
        CairnError::BlobNotFound(_) => StatusCode::NOT_FOUND,
        CairnError::InvalidRequest(_) | CairnError::HashMismatch { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn invalid_oid(oid: &str) -> Option<Response> {
    (!is_valid_oid(oid)).then(|| error_response(StatusCode::BAD_REQUEST, format!("invalid oid: {}", oid)))
}

pub async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = serde_json::json!({
        "node_id": state.ctx.node_id(),
        "started_at": state.ctx.started_at,
        "pending_tasks": state.ctx.tasks.pending(),
    });
    (StatusCode::OK, axum::Json(response))
}

pub async fn get_blob(
    State(state): State<Arc<ServerState>>,
    Path(oid): Path<String>,
) -> Response {
    if let Some(response) = invalid_oid(&oid) {
        return response;
    }
    let ctx = &state.ctx;

    match ctx.blobs.open(&oid).await {
        Ok(Some((file, length))) => {
            let access_ctx = ctx.clone();
            let access_oid = oid.clone();
            tokio::spawn(async move {
                if let Err(error) = access_ctx
                    .ledger
                    .record_access(&access_oid, access_ctx.node_id())
                    .await
                {
                    tracing::debug!("Failed to record access for {}: {}", access_oid, error);
                }
            });

            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (header::CONTENT_LENGTH, length.to_string()),
                ],
                Body::from_stream(ReaderStream::new(file)),
            )
                .into_response()
        }
        Ok(None) => {
            // Whatever the ledger says, this node does not have it.
            if let Err(error) = ctx.ledger.remove_ownership(&oid, ctx.node_id()).await {
                tracing::warn!("Failed to drop ownership of missing blob {}: {}", oid, error);
            }
            error_response(StatusCode::NOT_FOUND, format!("blob not found: {}", oid))
        }
        Err(error) => error_response(status_for(&error), error),
    }
}

pub async fn head_blob(
    State(state): State<Arc<ServerState>>,
    Path(oid): Path<String>,
) -> StatusCode {
    if is_valid_oid(&oid) && state.ctx.blobs.exists(&oid) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn put_blob(
    State(state): State<Arc<ServerState>>,
    Path(oid): Path<String>,
    body: Bytes,
) -> Response {
    if let Some(response) = invalid_oid(&oid) {
        return response;
    }
    match state.ctx.store_local_blob(&oid, body).await {
        Ok(length) => {
            tracing::info!("Stored blob {} ({} bytes)", oid, length);
            (StatusCode::CREATED, axum::Json(serde_json::json!({ "oid": oid, "length": length })))
                .into_response()
        }
        Err(error) => {
            tracing::warn!("Failed to store blob {}: {}", oid, error);
            error_response(status_for(&error), error)
        }
    }
}

pub async fn delete_blob(
    State(state): State<Arc<ServerState>>,
    Path(oid): Path<String>,
) -> Response {
    if let Some(response) = invalid_oid(&oid) {
        return response;
    }
    match state.ctx.delete_local_blob(&oid).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(error) => error_response(status_for(&error), error),
    }
}

pub async fn request_fetch(
    State(state): State<Arc<ServerState>>,
    Path(oid): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(response) = invalid_oid(&oid) {
        return response;
    }
    let prev = headers
        .get(PREV_NODE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    if state.ctx.accept_fetch(&oid, prev) {
        StatusCode::ACCEPTED.into_response()
    } else {
        error_response(StatusCode::SERVICE_UNAVAILABLE, "task queue full")
    }
}

pub async fn list_nodes(State(state): State<Arc<ServerState>>) -> Response {
    let config = state.ctx.cluster_config();
    match state.ctx.node_view().await {
        Ok(view) => ok_json(view.live(config.heartbeat_freq)),
        Err(error) => error_response(status_for(&error), error),
    }
}

pub async fn show_config(State(state): State<Arc<ServerState>>) -> Response {
    ok_json(state.ctx.cluster_config().as_ref().clone())
}

pub async fn fsck_all(state: State<Arc<ServerState>>) -> Response {
    run_fsck(state, String::new()).await
}

pub async fn fsck(state: State<Arc<ServerState>>, Path(prefix): Path<String>) -> Response {
    run_fsck(state, prefix).await
}

/// One JSON object per file, newline separated.
async fn run_fsck(State(state): State<Arc<ServerState>>, prefix: String) -> Response {
    let operation = FsckOperation::new(state.catalog.clone(), state.ctx.ledger.clone());
    let request = FsckOperationRequest { prefix };
    match operation.run(request, &CancellationToken::new()).await {
        Ok(result) => {
            let mut body = String::new();
            for entry in &result.entries {
                match serde_json::to_string(entry) {
                    Ok(line) => {
                        body.push_str(&line);
                        body.push('\n');
                    }
                    Err(error) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, error),
                }
            }
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/x-ndjson")],
                body,
            )
                .into_response()
        }
        Err(error) => error_response(status_for(&error), error),
    }
}
