use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::FuturesUnordered;
use futures_util::{Stream, StreamExt, TryStreamExt};
use parcel_transfer::{Chunk, RetryPolicy, SpeedMeter, TransferError, chunk_stream, digest_hex};
use parcel_types::{
    FileMetadata, FinalizeRequest, FinalizeResponse, InitUploadRequest, InitUploadResponse,
    SecurityConfig, TransferMetrics,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::{PayloadCipher, encrypt_stream};
use crate::transport::{ChunkRequest, Transport};

/// Knobs for one upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Requested chunk size; the server's answer wins.
    pub chunk_size: usize,
    pub max_parallel_chunks: usize,
    pub retry: RetryPolicy,
    pub security: SecurityConfig,
    pub session_id: Option<String>,
    /// Seconds the finished artifact stays downloadable.
    pub time_limit: Option<u64>,
    pub download_limit: Option<u32>,
    pub authorization: String,
    /// Size here is an estimate; it only feeds init and progress totals.
    pub file: FileMetadata,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: parcel_transfer::DEFAULT_CHUNK_SIZE,
            max_parallel_chunks: parcel_transfer::DEFAULT_MAX_PARALLEL_CHUNKS,
            retry: RetryPolicy::default(),
            security: SecurityConfig::default(),
            session_id: None,
            time_limit: None,
            download_limit: None,
            authorization: String::new(),
            file: FileMetadata::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// A chunk owned by the scheduler until the server acknowledged it.
#[derive(Debug)]
pub struct UploadTask {
    pub index: u32,
    pub payload: Bytes,
    pub digest: Option<String>,
    pub attempts: u32,
    pub status: TaskStatus,
}

impl UploadTask {
    fn new(chunk: Chunk, security: &SecurityConfig) -> Self {
        let digest = security
            .enable_verification
            .then(|| digest_hex(security.hash_algorithm, &chunk.data));
        Self {
            index: chunk.index,
            payload: chunk.data,
            digest,
            attempts: 0,
            status: TaskStatus::Pending,
        }
    }
}

/// Observable milestones of an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Started {
        upload_id: String,
        chunk_size: u64,
        estimated_chunks: u32,
    },
    ChunkUploaded {
        index: u32,
        attempts: u32,
    },
    Retrying {
        index: u32,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// `total_bytes` is exact once the source is exhausted, an estimate before.
    Progress {
        bytes_uploaded: u64,
        total_bytes: u64,
        bytes_per_second: f64,
    },
    Finalized {
        file_id: String,
        url: String,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

/// Drives one chunked upload: init, a bounded window of concurrent chunk
/// uploads with per-chunk retry, then finalize.
///
/// Resolves to exactly one of success, failure, or [`TransferError::Cancelled`].
/// Failures and cancellation trigger a best-effort cleanup of the server session.
pub struct UploadScheduler {
    transport: Arc<dyn Transport>,
    options: UploadOptions,
    events: Option<mpsc::Sender<UploadEvent>>,
    cancel: CancellationToken,
}

impl UploadScheduler {
    pub fn new(transport: Arc<dyn Transport>, options: UploadOptions) -> Self {
        Self {
            transport,
            options,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<UploadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads an already-encrypted byte stream.
    pub async fn run<S>(&self, source: S) -> Result<FinalizeResponse, TransferError>
    where
        S: Stream<Item = Result<Bytes, TransferError>> + Send,
    {
        self.run_with_estimate(source, self.options.file.size).await
    }

    /// Encrypts the file at `path` on the fly and uploads the ciphertext.
    pub async fn upload_file(
        &self,
        path: &Path,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Result<FinalizeResponse, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let plain_len = file.metadata().await?.len();
        let estimate = cipher.encrypted_len(plain_len);
        info!("Uploading {} ({} bytes, ~{} encrypted)", path.display(), plain_len, estimate);

        let plaintext = ReaderStream::new(file).map_err(TransferError::from);
        self.run_with_estimate(encrypt_stream(cipher, plaintext), Some(estimate))
            .await
    }

    async fn run_with_estimate<S>(
        &self,
        source: S,
        size_estimate: Option<u64>,
    ) -> Result<FinalizeResponse, TransferError>
    where
        S: Stream<Item = Result<Bytes, TransferError>> + Send,
    {
        if self.cancel.is_cancelled() {
            self.emit(UploadEvent::Cancelled).await;
            return Err(TransferError::Cancelled);
        }
        if size_estimate == Some(0) {
            self.emit(UploadEvent::Failed {
                reason: TransferError::EmptyUpload.to_string(),
            })
            .await;
            return Err(TransferError::EmptyUpload);
        }

        let init = self.transport.init(&self.init_request(size_estimate)).await?;
        info!(
            "Upload {} started: {} chunks of {} bytes expected",
            init.upload_id, init.total_chunks, init.chunk_size
        );
        self.emit(UploadEvent::Started {
            upload_id: init.upload_id.clone(),
            chunk_size: init.chunk_size,
            estimated_chunks: init.total_chunks,
        })
        .await;

        let result = self.transfer(&init, source, size_estimate.unwrap_or(0)).await;
        match &result {
            Ok(done) => {
                info!("Upload {} finalized as {} ({} bytes)", init.upload_id, done.file_id, done.size);
                self.emit(UploadEvent::Finalized {
                    file_id: done.file_id.clone(),
                    url: done.url.clone(),
                })
                .await;
            }
            Err(e) => {
                if let Err(cleanup) = self.transport.cleanup(&init.upload_id).await {
                    debug!("Cleanup of {} failed: {}", init.upload_id, cleanup);
                }
                if matches!(e, TransferError::Cancelled) {
                    info!("Upload {} cancelled", init.upload_id);
                    self.emit(UploadEvent::Cancelled).await;
                } else {
                    warn!("Upload {} failed: {}", init.upload_id, e);
                    self.emit(UploadEvent::Failed { reason: e.to_string() }).await;
                }
            }
        }
        result
    }

    fn init_request(&self, size_estimate: Option<u64>) -> InitUploadRequest {
        let opts = &self.options;
        InitUploadRequest {
            file_metadata: FileMetadata {
                size: size_estimate,
                ..opts.file.clone()
            },
            authorization: Some(opts.authorization.clone()),
            bearer: None,
            time_limit: opts.time_limit,
            dlimit: opts.download_limit,
            chunk_size: Some(opts.chunk_size as u64),
            session_id: opts.session_id.clone(),
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
            security_config: opts.security,
        }
    }

    async fn transfer<S>(
        &self,
        init: &InitUploadResponse,
        source: S,
        size_estimate: u64,
    ) -> Result<FinalizeResponse, TransferError>
    where
        S: Stream<Item = Result<Bytes, TransferError>> + Send,
    {
        let chunk_size = usize::try_from(init.chunk_size)
            .ok()
            .filter(|&size| size > 0)
            .unwrap_or(self.options.chunk_size);
        let window = self.options.max_parallel_chunks.max(1);
        let total_hint = (init.total_chunks > 0).then_some(init.total_chunks);

        let chunks = chunk_stream(source, chunk_size);
        tokio::pin!(chunks);

        let started = Instant::now();
        let retries = AtomicU32::new(0);
        let mut inflight = FuturesUnordered::new();
        let mut digests: BTreeMap<u32, String> = BTreeMap::new();
        let mut meter = SpeedMeter::new();
        let mut bytes_read: u64 = 0;
        let mut bytes_uploaded: u64 = 0;
        let mut dispatched: u32 = 0;
        let mut source_done = false;
        let mut reported_total = None;
        let mut failure: Option<TransferError> = None;

        loop {
            if failure.is_none() && self.cancel.is_cancelled() {
                failure = Some(TransferError::Cancelled);
            }
            let can_dispatch = failure.is_none() && !source_done && inflight.len() < window;
            if !can_dispatch && inflight.is_empty() {
                break;
            }

            tokio::select! {
                next = chunks.next(), if can_dispatch => match next {
                    Some(Ok(chunk)) => {
                        if self.cancel.is_cancelled() {
                            failure = Some(TransferError::Cancelled);
                            continue;
                        }
                        bytes_read += chunk.len() as u64;
                        dispatched += 1;
                        let task = UploadTask::new(chunk, &self.options.security);
                        inflight.push(self.send_task(&init.upload_id, task, total_hint, &retries));
                    }
                    Some(Err(e)) => failure = Some(e),
                    None => source_done = true,
                },
                Some((task, result)) = inflight.next(), if !inflight.is_empty() => match result {
                    Ok(_) => {
                        bytes_uploaded += task.payload.len() as u64;
                        if let Some(digest) = task.digest {
                            digests.insert(task.index, digest);
                        }
                        meter.record(bytes_uploaded);
                        self.emit(UploadEvent::ChunkUploaded {
                            index: task.index,
                            attempts: task.attempts,
                        })
                        .await;
                        let total_bytes = if source_done {
                            bytes_read
                        } else {
                            size_estimate.max(bytes_read)
                        };
                        self.emit(UploadEvent::Progress {
                            bytes_uploaded,
                            total_bytes,
                            bytes_per_second: meter.bytes_per_second(),
                        })
                        .await;
                        reported_total = Some(total_bytes);
                    }
                    Err(e) => {
                        warn!("Chunk {} failed after {} attempts: {}", task.index, task.attempts, e);
                        failure.get_or_insert(e);
                    }
                },
                _ = self.cancel.cancelled(), if failure.is_none() => {
                    failure = Some(TransferError::Cancelled);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if dispatched == 0 {
            return Err(TransferError::EmptyUpload);
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        // the last chunk can land before the source reports its end
        if reported_total != Some(bytes_read) {
            self.emit(UploadEvent::Progress {
                bytes_uploaded,
                total_bytes: bytes_read,
                bytes_per_second: meter.bytes_per_second(),
            })
            .await;
        }

        let elapsed = started.elapsed();
        let integrity_hashes = if self.options.security.enable_verification {
            digests.into_values().collect()
        } else {
            Vec::new()
        };
        let request = FinalizeRequest {
            upload_id: init.upload_id.clone(),
            session_id: self.options.session_id.clone(),
            total_chunks: dispatched,
            total_size: Some(bytes_read),
            integrity_hashes,
            metrics: Some(TransferMetrics {
                duration_ms: elapsed.as_millis() as u64,
                retries: retries.load(Ordering::Relaxed),
                average_speed_bps: if elapsed.is_zero() {
                    0.0
                } else {
                    bytes_uploaded as f64 / elapsed.as_secs_f64()
                },
            }),
        };
        self.transport.finalize(&request).await
    }

    /// Uploads one task under the retry policy and hands it back with its outcome.
    async fn send_task(
        &self,
        upload_id: &str,
        mut task: UploadTask,
        total_hint: Option<u32>,
        retries: &AtomicU32,
    ) -> (UploadTask, Result<(), TransferError>) {
        task.status = TaskStatus::InFlight;
        let mut attempts = 0;

        let result = self
            .options
            .retry
            .run(
                |_| {
                    attempts += 1;
                    self.transport.upload_chunk(ChunkRequest {
                        upload_id: upload_id.to_string(),
                        session_id: self.options.session_id.clone(),
                        index: task.index,
                        total_chunks: total_hint,
                        digest: task.digest.clone(),
                        algorithm: self.options.security.hash_algorithm,
                        data: task.payload.clone(),
                    })
                },
                |attempt, delay, err| {
                    retries.fetch_add(1, Ordering::Relaxed);
                    if let Some(events) = &self.events {
                        let _ = events.try_send(UploadEvent::Retrying {
                            index: task.index,
                            attempt,
                            delay,
                            reason: err.to_string(),
                        });
                    }
                },
            )
            .await;

        task.attempts = attempts;
        task.status = if result.is_ok() {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        (task, result.map(|_| ()))
    }

    async fn emit(&self, event: UploadEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }
}
