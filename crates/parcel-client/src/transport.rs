use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use parcel_transfer::TransferError;
use parcel_types::{
    ChunkUploadResponse, CleanupResponse, ErrorBody, FinalizeRequest, FinalizeResponse,
    HashAlgorithm, InitUploadRequest, InitUploadResponse, headers,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// One chunk upload call.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: String,
    pub session_id: Option<String>,
    pub index: u32,
    /// Best known chunk total, sent as a hint.
    pub total_chunks: Option<u32>,
    pub digest: Option<String>,
    pub algorithm: HashAlgorithm,
    pub data: Bytes,
}

/// The upload calls the scheduler makes.
///
/// Errors come back classified: network failures and 5xx answers are
/// `Transient`; error bodies are mapped through [`TransferError::from_body`].
pub trait Transport: Send + Sync {
    fn init(&self, req: &InitUploadRequest) -> BoxFuture<'_, Result<InitUploadResponse, TransferError>>;

    fn upload_chunk(&self, chunk: ChunkRequest) -> BoxFuture<'_, Result<ChunkUploadResponse, TransferError>>;

    fn finalize(&self, req: &FinalizeRequest) -> BoxFuture<'_, Result<FinalizeResponse, TransferError>>;

    fn cleanup(&self, upload_id: &str) -> BoxFuture<'_, Result<(), TransferError>>;
}

/// Reads a stored blob back.
pub trait BlobFetcher: Send + Sync {
    /// Whole ciphertext in memory.
    fn fetch(&self, file_id: &str) -> BoxFuture<'_, Result<Bytes, TransferError>>;

    /// Ciphertext as a stream, plus its length when the server sent one.
    fn fetch_stream(&self, file_id: &str) -> BoxFuture<'_, Result<(ByteStream, Option<u64>), TransferError>>;
}

/// [`Transport`] and [`BlobFetcher`] over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn download(&self, file_id: &str) -> Result<Response, TransferError> {
        let resp = self
            .client
            .get(self.url(&format!("/api/download/{}", file_id)))
            .send()
            .await
            .map_err(network_error)?;
        check_status(resp).await
    }
}

fn network_error(e: reqwest::Error) -> TransferError {
    TransferError::Transient(e.to_string())
}

/// Passes successful responses through and turns error answers into
/// classified errors.
async fn check_status(resp: Response) -> Result<Response, TransferError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let raw = resp.bytes().await.unwrap_or_default();
    Err(classify(status, &raw))
}

fn classify(status: StatusCode, raw: &[u8]) -> TransferError {
    if status.is_server_error() {
        let detail = serde_json::from_slice::<ErrorBody>(raw)
            .map(|body| body.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(raw).into_owned());
        return TransferError::Transient(format!("server answered {}: {}", status, detail));
    }
    match serde_json::from_slice::<ErrorBody>(raw) {
        Ok(body) => TransferError::from_body(body),
        Err(_) if status == StatusCode::NOT_FOUND => TransferError::NotFound(status.to_string()),
        Err(_) => TransferError::Validation(format!(
            "server answered {}: {}",
            status,
            String::from_utf8_lossy(raw)
        )),
    }
}

async fn json<T: DeserializeOwned>(resp: Response) -> Result<T, TransferError> {
    let resp = check_status(resp).await?;
    resp.json()
        .await
        .map_err(|e| TransferError::Internal(format!("malformed response: {}", e)))
}

impl Transport for HttpTransport {
    fn init(&self, req: &InitUploadRequest) -> BoxFuture<'_, Result<InitUploadResponse, TransferError>> {
        let request = self.client.post(self.url("/api/upload/init")).json(req);
        Box::pin(async move { json(request.send().await.map_err(network_error)?).await })
    }

    fn upload_chunk(&self, chunk: ChunkRequest) -> BoxFuture<'_, Result<ChunkUploadResponse, TransferError>> {
        Box::pin(async move {
            let mut request = self
                .client
                .post(self.url("/api/upload/chunk"))
                .header(headers::UPLOAD_ID, &chunk.upload_id)
                .header(headers::CHUNK_INDEX, chunk.index.to_string())
                .header("content-type", "application/octet-stream");
            if let Some(session_id) = &chunk.session_id {
                request = request.header(headers::SESSION_ID, session_id);
            }
            if let Some(total) = chunk.total_chunks {
                request = request.header(headers::TOTAL_CHUNKS, total.to_string());
            }
            if let Some(digest) = &chunk.digest {
                request = request
                    .header(headers::CHUNK_HASH, digest)
                    .header(headers::HASH_ALGORITHM, chunk.algorithm.as_str());
            }

            debug!("Uploading chunk {} of {} ({} bytes)", chunk.index, chunk.upload_id, chunk.data.len());
            let resp = request.body(chunk.data).send().await.map_err(network_error)?;
            json(resp).await
        })
    }

    fn finalize(&self, req: &FinalizeRequest) -> BoxFuture<'_, Result<FinalizeResponse, TransferError>> {
        let request = self.client.post(self.url("/api/upload/finalize")).json(req);
        Box::pin(async move { json(request.send().await.map_err(network_error)?).await })
    }

    fn cleanup(&self, upload_id: &str) -> BoxFuture<'_, Result<(), TransferError>> {
        let request = self.client.delete(self.url(&format!("/api/upload/{}", upload_id)));
        Box::pin(async move {
            let _: CleanupResponse = json(request.send().await.map_err(network_error)?).await?;
            Ok(())
        })
    }
}

impl BlobFetcher for HttpTransport {
    fn fetch(&self, file_id: &str) -> BoxFuture<'_, Result<Bytes, TransferError>> {
        let file_id = file_id.to_string();
        Box::pin(async move {
            let resp = self.download(&file_id).await?;
            resp.bytes().await.map_err(network_error)
        })
    }

    fn fetch_stream(&self, file_id: &str) -> BoxFuture<'_, Result<(ByteStream, Option<u64>), TransferError>> {
        let file_id = file_id.to_string();
        Box::pin(async move {
            let resp = self.download(&file_id).await?;
            let length = resp.content_length();
            let stream: ByteStream = Box::pin(resp.bytes_stream().map(|r| r.map_err(network_error)));
            Ok((stream, length))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcel_types::ErrorCode;

    #[test]
    fn server_errors_are_transient() {
        let err = classify(StatusCode::INTERNAL_SERVER_ERROR, b"{\"error\":\"internal\",\"message\":\"disk\"}");
        assert!(matches!(err, TransferError::Transient(_)));
        assert!(err.is_retryable());
        assert!(classify(StatusCode::BAD_GATEWAY, b"<html>").is_retryable());
    }

    #[test]
    fn error_bodies_keep_their_kind() {
        let body = serde_json::to_vec(&ErrorBody {
            error: ErrorCode::Integrity,
            message: "chunk 1 hash mismatch".into(),
            chunk_index: None,
            received: None,
            expected: None,
        })
        .unwrap();
        assert!(matches!(classify(StatusCode::BAD_REQUEST, &body), TransferError::Integrity(_)));
        assert!(matches!(classify(StatusCode::NOT_FOUND, b""), TransferError::NotFound(_)));
        assert!(matches!(classify(StatusCode::BAD_REQUEST, b"nope"), TransferError::Validation(_)));
    }
}
