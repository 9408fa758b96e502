use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{FromRequest, Path, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use parcel_transfer::TransferError;
use serde::de::DeserializeOwned;
use parcel_types::{
    FinalizeRequest, HashAlgorithm, HealthStatus, InitUploadRequest, InitUploadResponse, headers,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::assembler::{ChunkAssembler, IncomingChunk};
use crate::health::HealthMonitor;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub assembler: Arc<ChunkAssembler>,
    pub health: Arc<HealthMonitor>,
}

/// A [`TransferError`] rendered as a JSON error body.
#[derive(Debug)]
pub struct ApiError(pub TransferError);

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TransferError::NotFound(_) => StatusCode::NOT_FOUND,
            TransferError::Validation(_)
            | TransferError::Integrity(_)
            | TransferError::IncompleteUpload { .. }
            | TransferError::MissingChunk(_)
            | TransferError::EmptyUpload => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }
        (status, Json(self.0.to_body())).into_response()
    }
}

/// `Json` extractor whose rejections answer as validation errors.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(TransferError::Validation(format!(
                "invalid metadata: {}",
                rejection.body_text()
            )))),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

// -- Handlers --

/// POST /api/upload/init
pub async fn init_upload(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<InitUploadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = state.assembler.registry();
    let session_id = req.session_id.clone();
    let outcome = registry.init(req)?;

    Ok(Json(InitUploadResponse {
        url: format!("{}/api/download/{}", registry.config().public_url, outcome.file_id),
        upload_id: outcome.upload_id,
        id: outcome.file_id,
        owner_token: outcome.owner_token,
        total_chunks: outcome.total_chunks,
        chunk_size: outcome.chunk_size,
        session_id,
    }))
}

/// POST /api/upload/chunk. Chunk coordinates travel in `x-*` headers, the
/// body is the raw chunk.
pub async fn upload_chunk(
    State(state): State<AppState>,
    header_map: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let upload_id = header_str(&header_map, headers::UPLOAD_ID)
        .ok_or_else(|| TransferError::Validation("missing upload id".into()))?
        .to_string();

    let index: u32 = header_str(&header_map, headers::CHUNK_INDEX)
        .ok_or_else(|| TransferError::Validation("missing chunk index".into()))?
        .parse()
        .map_err(|_| TransferError::Validation("invalid chunk index".into()))?;

    let algorithm = header_str(&header_map, headers::HASH_ALGORITHM)
        .map(|raw| raw.parse::<HashAlgorithm>())
        .transpose()
        .map_err(TransferError::Validation)?;

    let response = state
        .assembler
        .accept_chunk(IncomingChunk {
            upload_id,
            index,
            data: body,
            digest: header_str(&header_map, headers::CHUNK_HASH).map(str::to_string),
            algorithm,
        })
        .await?;

    Ok(Json(response))
}

/// POST /api/upload/finalize
pub async fn finalize_upload(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<FinalizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.assembler.finalize(req).await?))
}

/// DELETE /api/upload/{id}
pub async fn cleanup_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> impl IntoResponse {
    Json(state.assembler.cleanup(&upload_id).await)
}

/// GET /api/upload/{id}/status
pub async fn upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.assembler.registry().status(&upload_id).await?))
}

/// GET /api/download/{id}. Streams the stored ciphertext and consumes one
/// download from the blob's allowance.
pub async fn download_blob(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let blobs = state.assembler.blobs();
    let blob = blobs
        .open(&file_id)
        .await?
        .ok_or_else(|| TransferError::NotFound(file_id.clone()))?;

    // the open reader survives deletion of the last allowed download
    let left = blobs.record_download(&file_id).await?;
    info!("Blob {} downloaded ({} bytes, {:?} left)", file_id, blob.meta.size, left);

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_LENGTH, blob.meta.size.to_string()),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(blob.reader))))
}

/// GET /api/health. Answers 503 while critical.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.assembler.registry();
    let report = state.health.report(
        registry.active(),
        registry.stats().total.load(std::sync::atomic::Ordering::Relaxed),
        registry.config().max_active_uploads,
    );
    let status = if report.status == HealthStatus::Critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}
