use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parcel_transfer::{TransferError, chunk_count};
use parcel_types::{InitUploadRequest, StatusResponse};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::config::ServerConfig;
use crate::session::{SessionMetadata, TransferSession};
use crate::store::{SessionHandle, SessionStore};

/// Upload counters shared by every session.
#[derive(Debug, Default)]
pub struct UploadStats {
    pub total: AtomicU64,
    pub completed: AtomicU64,
    pub abandoned: AtomicU64,
}

/// Identifiers handed back by a successful init.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub upload_id: String,
    pub file_id: String,
    pub owner_token: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

/// Creates sessions and looks them up.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    config: Arc<ServerConfig>,
    stats: UploadStats,
}

/// 128 random bits, hex-encoded.
pub fn random_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, config: Arc<ServerConfig>) -> Self {
        Self {
            store,
            config,
            stats: UploadStats::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> &UploadStats {
        &self.stats
    }

    pub fn active(&self) -> u64 {
        self.store.len() as u64
    }

    /// Validates an init request and opens a new session.
    pub fn init(&self, req: InitUploadRequest) -> Result<InitOutcome, TransferError> {
        let size = match req.file_metadata.size {
            Some(size) if size > 0 => size,
            _ => return Err(TransferError::Validation("invalid metadata: size must be positive".into())),
        };

        let authorization = req
            .authorization
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| TransferError::Validation("missing authorization".into()))?;

        let chunk_size = req.chunk_size.unwrap_or(self.config.default_chunk_size);
        if chunk_size == 0 || chunk_size > self.config.max_chunk_size {
            return Err(TransferError::Validation(format!(
                "chunk size must be between 1 and {} bytes",
                self.config.max_chunk_size
            )));
        }

        let time_limit = match req.time_limit {
            None => self.config.default_time_limit,
            Some(0) => return Err(TransferError::Validation("time limit must be positive".into())),
            Some(secs) => Duration::from_secs(secs),
        };
        if time_limit > self.config.max_time_limit {
            return Err(TransferError::Validation(format!(
                "time limit exceeds {} seconds",
                self.config.max_time_limit.as_secs()
            )));
        }

        let download_limit = req.dlimit.unwrap_or(1);
        if download_limit == 0 || download_limit > self.config.max_downloads {
            return Err(TransferError::Validation(format!(
                "download limit must be between 1 and {}",
                self.config.max_downloads
            )));
        }

        if size.div_ceil(chunk_size) > u64::from(u32::MAX) {
            return Err(TransferError::Validation(format!(
                "{} bytes in {} byte chunks needs too many chunks",
                size, chunk_size
            )));
        }
        let estimated_chunks = chunk_count(size, chunk_size);
        let now = Utc::now();
        let upload_id = random_id();
        let file_id = random_id();
        let owner_token = random_id();

        let session = TransferSession {
            upload_id: upload_id.clone(),
            file_id: file_id.clone(),
            owner_token: owner_token.clone(),
            client_session_id: req.session_id,
            size_estimate: size,
            chunk_size,
            estimated_chunks,
            declared_chunks: None,
            chunks: BTreeMap::new(),
            created_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            time_limit,
            download_limit,
            metadata: SessionMetadata {
                metadata: req.file_metadata.metadata,
                authorization,
                name: req.file_metadata.name,
                content_type: req.file_metadata.content_type,
            },
            security: req.security_config,
            closed: false,
        };

        if !self.store.insert(upload_id.clone(), Arc::new(Mutex::new(session))) {
            return Err(TransferError::Internal("upload id collision".into()));
        }
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        info!(
            "Upload {} created: {} bytes, {} chunks of {} bytes, verification={}",
            upload_id,
            size,
            estimated_chunks,
            chunk_size,
            req.security_config.enable_verification
        );

        Ok(InitOutcome {
            upload_id,
            file_id,
            owner_token,
            total_chunks: estimated_chunks,
            chunk_size,
        })
    }

    pub fn get(&self, upload_id: &str) -> Result<SessionHandle, TransferError> {
        self.store
            .get(upload_id)
            .ok_or_else(|| TransferError::NotFound(upload_id.to_string()))
    }

    pub(crate) fn remove(&self, upload_id: &str) -> Option<SessionHandle> {
        self.store.remove(upload_id)
    }

    pub(crate) fn restore(&self, upload_id: &str, handle: SessionHandle) -> bool {
        self.store.insert(upload_id.to_string(), handle)
    }

    pub(crate) fn handles(&self) -> Vec<(String, SessionHandle)> {
        self.store.handles()
    }

    /// Snapshot of a live session's progress.
    pub async fn status(&self, upload_id: &str) -> Result<StatusResponse, TransferError> {
        let handle = self.get(upload_id)?;
        let session = handle.lock().await;
        if session.closed {
            return Err(TransferError::NotFound(upload_id.to_string()));
        }
        Ok(session.status())
    }
}
