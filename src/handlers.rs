use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap},
    response::Json,
};
use std::sync::Arc;

use crate::assembler::AssemblyError;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    ChunkResponse, InitResponse, SessionStatusResponse, HEADER_CHUNKS_QUANTITY, HEADER_CHUNK_ID,
    HEADER_CONTENT_ID, HEADER_CONTENT_LENGTH, HEADER_CONTENT_NAME,
};
use crate::registry::short_id;
use crate::state::AppState;

const INIT_ERROR_PREFIX: &str = "Can't initialize file uploading";

// value of a header as text, non utf-8 values count as absent
fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

// required numeric header of the init request
fn init_number<T: std::str::FromStr>(
    headers: &HeaderMap,
    name: &'static str,
    label: &str,
) -> ApiResult<T> {
    let raw = header_str(headers, name).ok_or_else(|| {
        tracing::warn!("Init request missing {} header", name);
        ApiError::bad_request(format!(
            "{}: request has no {} header",
            INIT_ERROR_PREFIX, label
        ))
    })?;

    raw.parse().map_err(|_| {
        tracing::warn!("Init request has non-numeric {} header: {:?}", name, raw);
        ApiError::bad_request(format!("{}: {} header is not a number", INIT_ERROR_PREFIX, label))
    })
}

// initialize a chunked upload session
pub async fn init_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<InitResponse>> {
    let name = header_str(&headers, HEADER_CONTENT_NAME)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            tracing::warn!("Init request missing {} header", HEADER_CONTENT_NAME);
            ApiError::bad_request(format!(
                "{}: request has no content name header",
                INIT_ERROR_PREFIX
            ))
        })?
        .to_string();

    let size: u64 = init_number(&headers, HEADER_CONTENT_LENGTH, "content length")?;
    let chunks_quantity: usize = init_number(&headers, HEADER_CHUNKS_QUANTITY, "chunks quantity")?;

    tracing::debug!(
        "Initializing upload for {} ({} bytes in {} chunks)",
        name,
        size,
        chunks_quantity
    );

    let file_id = state.assembler.open(name.clone(), size, chunks_quantity).await?;

    tracing::info!("📤 Initialized upload: {} (ID: {})", name, short_id(&file_id));

    Ok(Json(InitResponse {
        status: 200,
        file_id,
    }))
}

// store one chunk of an upload
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<ChunkResponse>> {
    let file_id = header_str(&headers, HEADER_CONTENT_ID).ok_or_else(|| {
        tracing::warn!("Chunk request missing {} header", HEADER_CONTENT_ID);
        ApiError::bad_request("Request has no content id header")
    })?;

    let chunk_id = header_str(&headers, HEADER_CHUNK_ID).ok_or_else(|| {
        tracing::warn!("Chunk request missing {} header", HEADER_CHUNK_ID);
        ApiError::bad_request("Request has no chunk id header")
    })?;

    let index: usize = chunk_id.parse().map_err(|_| {
        tracing::warn!("Chunk request has invalid chunk id: {:?}", chunk_id);
        ApiError::bad_request("Chunk id header is not a valid index")
    })?;

    if state.registry.get_session(file_id).is_none() {
        tracing::warn!("Upload ID not found: {}", short_id(file_id));
        return Err(AssemblyError::UnknownSession.into());
    }

    let declared: u64 = header_str(&headers, header::CONTENT_LENGTH)
        .ok_or_else(|| ApiError::bad_request("Request has no content length header"))?
        .parse()
        .map_err(|_| ApiError::bad_request("Request has no content length header"))?;

    if declared > state.max_chunk_size as u64 {
        tracing::warn!("Chunk {} declares {} bytes, above the limit", index, declared);
        return Err(ApiError::bad_request("Chunk is larger than the allowed maximum"));
    }

    tracing::trace!("Receiving chunk {} for upload {}", index, short_id(file_id));

    // a body that ends early or errors out is a truncated chunk
    let bytes = axum::body::to_bytes(body, state.max_chunk_size)
        .await
        .map_err(|e| {
            tracing::warn!("Failed to read chunk {} body: {}", index, e);
            AssemblyError::IncompleteChunk {
                declared,
                received: 0,
            }
        })?;

    let receipt = state
        .assembler
        .accept_chunk(file_id, index, bytes, declared)
        .await?;

    Ok(Json(ChunkResponse {
        status: 200,
        size: receipt.size,
    }))
}

// progress of an upload session
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> ApiResult<Json<SessionStatusResponse>> {
    let handle = state.registry.get_session(&file_id).ok_or(ApiError::NotFound)?;
    let session = handle.lock().await;

    Ok(Json(SessionStatusResponse {
        status: 200,
        file_id,
        name: session.filename.clone(),
        size: session.total_size,
        chunks_quantity: session.chunk_count,
        chunks_done: session.received(),
    }))
}

// health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "chunkferry",
        "activeUploads": state.registry.len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
