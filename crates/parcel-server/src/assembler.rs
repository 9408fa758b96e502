use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parcel_transfer::{TransferError, verify_digest};
use parcel_types::{ChunkUploadResponse, CleanupResponse, FinalizeRequest, FinalizeResponse, HashAlgorithm};
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;
use crate::session::{StoredChunk, TransferSession};
use crate::storage::{BlobMeta, BlobStore};

/// One chunk as it arrived over the wire.
#[derive(Debug, Clone)]
pub struct IncomingChunk {
    pub upload_id: String,
    pub index: u32,
    pub data: Bytes,
    pub digest: Option<String>,
    pub algorithm: Option<HashAlgorithm>,
}

/// Accepts chunks into sessions and turns complete sessions into blobs.
pub struct ChunkAssembler {
    registry: Arc<SessionRegistry>,
    blobs: Arc<dyn BlobStore>,
}

impl ChunkAssembler {
    pub fn new(registry: Arc<SessionRegistry>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { registry, blobs }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub async fn accept_chunk(&self, chunk: IncomingChunk) -> Result<ChunkUploadResponse, TransferError> {
        let handle = self.registry.get(&chunk.upload_id)?;
        let mut session = handle.lock().await;
        if session.closed {
            return Err(TransferError::NotFound(chunk.upload_id));
        }

        if chunk.data.is_empty() {
            return Err(TransferError::Validation("missing chunk data".into()));
        }
        if chunk.data.len() as u64 > session.chunk_size {
            return Err(TransferError::Validation(format!(
                "chunk {} is {} bytes, limit is {}",
                chunk.index,
                chunk.data.len(),
                session.chunk_size
            )));
        }
        if let Some(total) = session.declared_chunks.filter(|&total| chunk.index >= total) {
            return Err(TransferError::Validation(format!(
                "chunk index {} out of range for {} chunks",
                chunk.index, total
            )));
        }

        let digest = if session.security.enable_verification {
            Some(verify_chunk(&session, &chunk)?)
        } else {
            None
        };

        session.store_chunk(
            chunk.index,
            StoredChunk {
                data: chunk.data,
                digest,
                received_at: Utc::now(),
            },
        );

        let response = ChunkUploadResponse {
            upload_id: chunk.upload_id,
            chunk_index: chunk.index,
            received_chunks: session.received(),
            total_chunks: session.total_chunks(),
            is_complete: session.is_complete(),
        };
        debug!(
            "Upload {}: chunk {} stored ({}/{:?})",
            response.upload_id, response.chunk_index, response.received_chunks, response.total_chunks
        );
        Ok(response)
    }

    /// Assembles every chunk into one blob and retires the session.
    ///
    /// All-or-nothing: on any failure the session stays as it was and no blob
    /// remains in the store.
    pub async fn finalize(&self, req: FinalizeRequest) -> Result<FinalizeResponse, TransferError> {
        let handle = self.registry.get(&req.upload_id)?;
        let mut session = handle.lock().await;
        if session.closed {
            return Err(TransferError::NotFound(req.upload_id));
        }
        session.touch();

        let total = req.total_chunks;
        if total == 0 {
            return Err(TransferError::EmptyUpload);
        }
        if !session.declare_total(total) {
            debug!("Upload {}: chunks stored past declared total {}", req.upload_id, total);
        }

        let received = session.received();
        if received != total {
            warn!("Upload {}: finalize with {}/{} chunks", req.upload_id, received, total);
            return Err(TransferError::IncompleteUpload {
                received,
                expected: total,
            });
        }

        if session.security.enable_verification && !req.integrity_hashes.is_empty() {
            check_integrity_hashes(&session, total, &req.integrity_hashes)?;
        }

        let data = session.assemble(total)?;
        let size = data.len() as u64;
        if let Some(declared) = req.total_size.filter(|&declared| declared != size) {
            return Err(TransferError::Validation(format!(
                "declared size {} does not match assembled size {}",
                declared, size
            )));
        }

        let ttl = chrono::Duration::from_std(session.time_limit)
            .map_err(|e| TransferError::Internal(format!("time limit out of range: {}", e)))?;
        let meta = BlobMeta {
            metadata: session.metadata.metadata.clone(),
            authorization: session.metadata.authorization.clone(),
            owner_token: session.owner_token.clone(),
            name: session.metadata.name.clone(),
            content_type: session.metadata.content_type.clone(),
            expires_at: Utc::now() + ttl,
            downloads_left: session.download_limit,
            size,
        };

        session.closed = true;
        self.registry.remove(&req.upload_id);

        let file_id = session.file_id.clone();
        if let Err(e) = self.blobs.put(&file_id, data, meta).await {
            warn!("Upload {}: storing blob {} failed: {}", req.upload_id, file_id, e);
            if let Err(cleanup) = self.blobs.delete(&file_id).await {
                warn!("Upload {}: removing partial blob failed: {}", req.upload_id, cleanup);
            }
            session.closed = false;
            self.registry.restore(&req.upload_id, handle.clone());
            return Err(e);
        }

        self.registry.stats().completed.fetch_add(1, Ordering::Relaxed);
        let duration = (Utc::now() - session.created_at).num_milliseconds().max(0) as u64;

        if let Some(metrics) = &req.metrics {
            debug!(
                "Upload {}: client reported {} ms, {} retries, {:.0} B/s",
                req.upload_id, metrics.duration_ms, metrics.retries, metrics.average_speed_bps
            );
        }
        info!(
            "Upload {} finalized as {}: {} bytes in {} chunks ({} ms)",
            req.upload_id, file_id, size, total, duration
        );

        Ok(FinalizeResponse {
            url: format!("{}/api/download/{}", self.registry.config().public_url, file_id),
            file_id,
            size,
            chunks: total,
            duration,
        })
    }

    /// Drops a session and anything stored for it. Always succeeds.
    pub async fn cleanup(&self, upload_id: &str) -> CleanupResponse {
        if let Ok(handle) = self.registry.get(upload_id) {
            let mut session = handle.lock().await;
            if !session.closed {
                self.retire(&mut session).await;
                self.registry.stats().abandoned.fetch_add(1, Ordering::Relaxed);
                info!("Upload {} cleaned up", upload_id);
            }
        } else {
            debug!("Cleanup for unknown upload {}", upload_id);
        }
        CleanupResponse { success: true }
    }

    /// Cleans every session idle for at least `stale_after`.
    pub async fn reap_stale(&self, stale_after: Duration) -> usize {
        let mut reaped = 0;
        for (upload_id, handle) in self.registry.handles() {
            let mut session = handle.lock().await;
            // activity may have landed between the snapshot and the lock
            if session.closed || session.idle_for() < stale_after {
                continue;
            }
            self.retire(&mut session).await;
            self.registry.stats().abandoned.fetch_add(1, Ordering::Relaxed);
            info!("Upload {} reaped after {:?} idle", upload_id, session.idle_for());
            reaped += 1;
        }
        reaped
    }

    async fn retire(&self, session: &mut TransferSession) {
        session.closed = true;
        self.registry.remove(&session.upload_id);
        session.chunks.clear();
        if let Err(e) = self.blobs.delete(&session.file_id).await {
            warn!("Upload {}: deleting blob {} failed: {}", session.upload_id, session.file_id, e);
        }
    }
}

fn verify_chunk(session: &TransferSession, chunk: &IncomingChunk) -> Result<String, TransferError> {
    let expected_algorithm = session.security.hash_algorithm;
    if let Some(algorithm) = chunk.algorithm.filter(|&a| a != expected_algorithm) {
        return Err(TransferError::Validation(format!(
            "hash algorithm {} does not match session algorithm {}",
            algorithm, expected_algorithm
        )));
    }

    let Some(expected) = chunk.digest.as_deref() else {
        return Err(TransferError::Validation(format!("chunk {} has no hash", chunk.index)));
    };

    verify_digest(expected_algorithm, &chunk.data, expected).map_err(|actual| {
        warn!(
            "Upload {}: chunk {} digest mismatch (expected {}, got {})",
            session.upload_id, chunk.index, expected, actual
        );
        TransferError::Integrity(format!("chunk {} hash mismatch", chunk.index))
    })
}

fn check_integrity_hashes(session: &TransferSession, total: u32, hashes: &[String]) -> Result<(), TransferError> {
    if hashes.len() != total as usize {
        return Err(TransferError::Integrity(format!(
            "expected {} integrity hashes, got {}",
            total,
            hashes.len()
        )));
    }
    for (index, claimed) in (0..total).zip(hashes) {
        let chunk = session.chunks.get(&index).ok_or(TransferError::MissingChunk(index))?;
        let matches = chunk
            .digest
            .as_deref()
            .is_some_and(|stored| stored.eq_ignore_ascii_case(claimed.trim()));
        if !matches {
            return Err(TransferError::Integrity(format!(
                "integrity hash for chunk {} does not match",
                index
            )));
        }
    }
    Ok(())
}
