use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parcel_transfer::TransferError;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::{AesGcmCipher, PayloadCipher, decrypt_all, decrypt_stream};
use crate::transport::{BlobFetcher, BoxFuture, ByteStream};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive unchanged polls after which a streaming download is hung.
pub const DEFAULT_HANG_POLLS: u32 = 30;

/// What to download and where to put it.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub file_id: String,
    pub master_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub destination: PathBuf,
    /// Ciphertext length, when known up front.
    pub expected_size: Option<u64>,
}

/// Agent-side view of a streaming download. Bytes count ciphertext.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentProgress {
    pub bytes_processed: u64,
    pub total_bytes: Option<u64>,
    pub done: bool,
}

/// A streaming downloader living behind a request/response channel.
pub trait DownloadAgent: Send + Sync {
    fn init(&self, req: &DownloadRequest) -> BoxFuture<'_, Result<(), TransferError>>;

    fn progress(&self) -> BoxFuture<'_, Result<AgentProgress, TransferError>>;

    fn cancel(&self) -> BoxFuture<'_, Result<(), TransferError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStrategy {
    Streaming,
    WholeBlob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub strategy: DownloadStrategy,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress {
        bytes_processed: u64,
        total_bytes: Option<u64>,
    },
    FellBack {
        reason: String,
    },
    Completed(DownloadOutcome),
}

/// Chooses between the streaming agent and a whole-blob download and
/// watches the agent for liveness.
///
/// If the agent cannot be initialised the controller downloads the blob in
/// one piece instead. Once the agent accepted the job, its errors are final.
pub struct DownloadController {
    agent: Option<Arc<dyn DownloadAgent>>,
    fetcher: Arc<dyn BlobFetcher>,
    poll_interval: Duration,
    hang_polls: u32,
    events: Option<mpsc::Sender<DownloadEvent>>,
    cancel: CancellationToken,
}

impl DownloadController {
    pub fn new(fetcher: Arc<dyn BlobFetcher>) -> Self {
        Self {
            agent: None,
            fetcher,
            poll_interval: DEFAULT_POLL_INTERVAL,
            hang_polls: DEFAULT_HANG_POLLS,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn DownloadAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_hang_polls(mut self, polls: u32) -> Self {
        self.hang_polls = polls.max(1);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<DownloadEvent>) -> Self {
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

    pub async fn run(&self, req: &DownloadRequest) -> Result<DownloadOutcome, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        if let Some(agent) = &self.agent {
            match agent.init(req).await {
                Ok(()) => {
                    info!("Streaming download of {} started", req.file_id);
                    return self.monitor(agent.as_ref(), req).await;
                }
                Err(e) => {
                    warn!("Streaming agent refused {}: {}; downloading whole blob", req.file_id, e);
                    self.emit(DownloadEvent::FellBack { reason: e.to_string() }).await;
                }
            }
        }

        self.whole_blob(req).await
    }

    async fn monitor(&self, agent: &dyn DownloadAgent, req: &DownloadRequest) -> Result<DownloadOutcome, TransferError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last_bytes = 0;
        let mut unchanged = 0;
        loop {
            ticker.tick().await;

            if self.cancel.is_cancelled() {
                if let Err(e) = agent.cancel().await {
                    debug!("Agent cancel for {} failed: {}", req.file_id, e);
                }
                info!("Download of {} cancelled", req.file_id);
                return Err(TransferError::Cancelled);
            }

            let progress = agent.progress().await?;
            self.emit(DownloadEvent::Progress {
                bytes_processed: progress.bytes_processed,
                total_bytes: progress.total_bytes,
            })
            .await;

            let expected = req.expected_size.or(progress.total_bytes);
            let reached = expected.is_some_and(|total| total > 0 && progress.bytes_processed >= total);
            if progress.done || reached {
                let outcome = DownloadOutcome {
                    strategy: DownloadStrategy::Streaming,
                    bytes: progress.bytes_processed,
                };
                info!("Download of {} finished ({} bytes)", req.file_id, outcome.bytes);
                self.emit(DownloadEvent::Completed(outcome)).await;
                return Ok(outcome);
            }

            if progress.bytes_processed == last_bytes {
                unchanged += 1;
                if unchanged >= self.hang_polls {
                    warn!("Download of {} stuck at {} bytes", req.file_id, last_bytes);
                    if let Err(e) = agent.cancel().await {
                        debug!("Agent cancel for {} failed: {}", req.file_id, e);
                    }
                    return Err(TransferError::Hung { polls: unchanged });
                }
            } else {
                last_bytes = progress.bytes_processed;
                unchanged = 0;
            }
        }
    }

    async fn whole_blob(&self, req: &DownloadRequest) -> Result<DownloadOutcome, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let ciphertext = self.fetcher.fetch(&req.file_id).await?;
        let cipher = AesGcmCipher::new(&req.master_key, &req.salt);
        let plaintext = decrypt_all(&cipher, &ciphertext)?;
        tokio::fs::write(&req.destination, &plaintext).await?;

        let outcome = DownloadOutcome {
            strategy: DownloadStrategy::WholeBlob,
            bytes: ciphertext.len() as u64,
        };
        info!("Downloaded {} in one piece ({} bytes)", req.file_id, outcome.bytes);
        self.emit(DownloadEvent::Completed(outcome)).await;
        Ok(outcome)
    }

    async fn emit(&self, event: DownloadEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }
}

// -- Channel agent --

enum AgentCommand {
    Init {
        req: DownloadRequest,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    Progress {
        reply: oneshot::Sender<Result<AgentProgress, TransferError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
}

/// Handle to an agent task started by [`spawn_agent`].
#[derive(Clone)]
pub struct ChannelAgent {
    tx: mpsc::Sender<AgentCommand>,
}

/// Starts a streaming download agent on the runtime.
///
/// The agent fetches ciphertext as a stream, decrypts it record by record
/// and writes plaintext to the destination. It is reachable only through the
/// returned handle and stops once every handle is dropped.
pub fn spawn_agent(fetcher: Arc<dyn BlobFetcher>) -> ChannelAgent {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(agent_loop(fetcher, rx));
    ChannelAgent { tx }
}

impl ChannelAgent {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, TransferError>>) -> AgentCommand,
    ) -> Result<T, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| agent_gone())?;
        rx.await.map_err(|_| agent_gone())?
    }
}

fn agent_gone() -> TransferError {
    TransferError::Internal("download agent is not running".into())
}

impl DownloadAgent for ChannelAgent {
    fn init(&self, req: &DownloadRequest) -> BoxFuture<'_, Result<(), TransferError>> {
        let req = req.clone();
        Box::pin(self.call(move |reply| AgentCommand::Init { req, reply }))
    }

    fn progress(&self) -> BoxFuture<'_, Result<AgentProgress, TransferError>> {
        Box::pin(self.call(|reply| AgentCommand::Progress { reply }))
    }

    fn cancel(&self) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(self.call(|reply| AgentCommand::Cancel { reply }))
    }
}

struct Job {
    bytes: Arc<AtomicU64>,
    total: Option<u64>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<(), TransferError>>>,
    done: bool,
}

impl Job {
    fn running(&self) -> bool {
        !self.done && self.handle.is_some()
    }

    async fn report(&mut self) -> Result<AgentProgress, TransferError> {
        let finished = self.handle.take_if(|handle| handle.is_finished());
        if let Some(handle) = finished {
            match handle.await {
                Ok(Ok(())) => self.done = true,
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(TransferError::Internal(format!("download task failed: {}", e))),
            }
        }
        Ok(AgentProgress {
            bytes_processed: self.bytes.load(Ordering::Relaxed),
            total_bytes: self.total,
            done: self.done,
        })
    }
}

async fn agent_loop(fetcher: Arc<dyn BlobFetcher>, mut rx: mpsc::Receiver<AgentCommand>) {
    let mut job: Option<Job> = None;

    while let Some(command) = rx.recv().await {
        match command {
            AgentCommand::Init { req, reply } => {
                if job.as_ref().is_some_and(Job::running) {
                    let _ = reply.send(Err(TransferError::Validation("a download is already running".into())));
                    continue;
                }
                let result = start_job(fetcher.as_ref(), req).await.map(|started| {
                    job = Some(started);
                });
                let _ = reply.send(result);
            }
            AgentCommand::Progress { reply } => {
                let result = match job.as_mut() {
                    Some(job) => job.report().await,
                    None => Err(TransferError::NotFound("no download in progress".into())),
                };
                let _ = reply.send(result);
            }
            AgentCommand::Cancel { reply } => {
                if let Some(job) = &job {
                    job.cancel.cancel();
                }
                let _ = reply.send(Ok(()));
            }
        }
    }

    if let Some(job) = job {
        job.cancel.cancel();
    }
    debug!("Download agent stopped");
}

async fn start_job(fetcher: &dyn BlobFetcher, req: DownloadRequest) -> Result<Job, TransferError> {
    let (stream, length) = fetcher.fetch_stream(&req.file_id).await?;
    let file = tokio::fs::File::create(&req.destination).await?;

    let cipher: Arc<dyn PayloadCipher> = Arc::new(AesGcmCipher::new(&req.master_key, &req.salt));
    let bytes = Arc::new(AtomicU64::new(0));
    let cancel = CancellationToken::new();

    let worker_bytes = bytes.clone();
    let worker_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        let result = stream_to_file(stream, cipher, file, worker_bytes, worker_cancel).await;
        if let Err(e) = &result {
            warn!("Streaming download of {} failed: {}", req.file_id, e);
            if let Err(rm) = tokio::fs::remove_file(&req.destination).await {
                debug!("Could not remove partial {}: {}", req.destination.display(), rm);
            }
        }
        result
    });

    Ok(Job {
        bytes,
        total: length.or(req.expected_size),
        cancel,
        handle: Some(handle),
        done: false,
    })
}

/// Decrypts `stream` into `file`. A record's bytes are counted only once the
/// next record is written or the file is flushed, so the counter never runs
/// ahead of what is on disk.
async fn stream_to_file(
    stream: ByteStream,
    cipher: Arc<dyn PayloadCipher>,
    mut file: tokio::fs::File,
    bytes: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<(), TransferError> {
    let overhead = cipher.overhead() as u64;
    let records = decrypt_stream(cipher, stream);
    tokio::pin!(records);

    let mut pending = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            next = records.next() => match next {
                Some(Ok(record)) => {
                    file.write_all(&record).await?;
                    bytes.fetch_add(pending, Ordering::Relaxed);
                    pending = record.len() as u64 + overhead;
                }
                Some(Err(e)) => return Err(e),
                None => break,
            },
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    bytes.fetch_add(pending, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use futures_util::stream;

    /// Serves one ciphertext from memory.
    struct MemoryFetcher {
        ciphertext: Bytes,
        fetches: AtomicUsize,
    }

    impl MemoryFetcher {
        fn new(plaintext: &[u8]) -> (Self, Vec<u8>) {
            let cipher = AesGcmCipher::new(b"key", b"salt");
            let sealed: Vec<u8> = plaintext
                .chunks(cipher.record_size())
                .enumerate()
                .flat_map(|(i, record)| cipher.encrypt_record(i as u64, record).unwrap().to_vec())
                .collect();
            let fetcher = Self {
                ciphertext: Bytes::from(sealed.clone()),
                fetches: AtomicUsize::new(0),
            };
            (fetcher, sealed)
        }
    }

    impl BlobFetcher for MemoryFetcher {
        fn fetch(&self, _file_id: &str) -> BoxFuture<'_, Result<Bytes, TransferError>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let data = self.ciphertext.clone();
            Box::pin(async move { Ok(data) })
        }

        fn fetch_stream(&self, _file_id: &str) -> BoxFuture<'_, Result<(ByteStream, Option<u64>), TransferError>> {
            let parts: Vec<Result<Bytes, TransferError>> = self
                .ciphertext
                .chunks(1000)
                .map(|p| Ok(Bytes::copy_from_slice(p)))
                .collect();
            let len = self.ciphertext.len() as u64;
            Box::pin(async move {
                let stream: ByteStream = Box::pin(stream::iter(parts));
                Ok((stream, Some(len)))
            })
        }
    }

    /// Replays a fixed script of progress reports.
    struct ScriptedAgent {
        init_error: bool,
        script: Mutex<Vec<Result<AgentProgress, TransferError>>>,
        stuck_at: u64,
        cancels: AtomicUsize,
        polls: AtomicUsize,
    }

    impl ScriptedAgent {
        fn new(script: Vec<Result<AgentProgress, TransferError>>) -> Self {
            Self {
                init_error: false,
                script: Mutex::new(script),
                stuck_at: 0,
                cancels: AtomicUsize::new(0),
                polls: AtomicUsize::new(0),
            }
        }
    }

    impl DownloadAgent for ScriptedAgent {
        fn init(&self, _req: &DownloadRequest) -> BoxFuture<'_, Result<(), TransferError>> {
            let fail = self.init_error;
            Box::pin(async move {
                if fail {
                    Err(TransferError::Internal("agent unavailable".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn progress(&self) -> BoxFuture<'_, Result<AgentProgress, TransferError>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    Ok(AgentProgress {
                        bytes_processed: self.stuck_at,
                        total_bytes: Some(100),
                        done: false,
                    })
                } else {
                    script.remove(0)
                }
            };
            Box::pin(async move { next })
        }

        fn cancel(&self) -> BoxFuture<'_, Result<(), TransferError>> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn at(bytes: u64) -> Result<AgentProgress, TransferError> {
        Ok(AgentProgress {
            bytes_processed: bytes,
            total_bytes: Some(100),
            done: false,
        })
    }

    fn request(destination: PathBuf) -> DownloadRequest {
        DownloadRequest {
            file_id: "file-1".into(),
            master_key: b"key".to_vec(),
            salt: b"salt".to_vec(),
            destination,
            expected_size: None,
        }
    }

    fn unused_fetcher() -> Arc<dyn BlobFetcher> {
        Arc::new(MemoryFetcher::new(b"unused").0)
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_completes_when_total_reached() {
        let agent = Arc::new(ScriptedAgent::new(vec![at(10), at(60), at(100)]));
        let controller = DownloadController::new(unused_fetcher()).with_agent(agent.clone());

        let outcome = controller.run(&request("unused".into())).await.unwrap();
        assert_eq!(outcome.strategy, DownloadStrategy::Streaming);
        assert_eq!(outcome.bytes, 100);
        assert_eq!(agent.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn no_progress_for_thirty_polls_is_a_hang() {
        let mut agent = ScriptedAgent::new(vec![at(5)]);
        agent.stuck_at = 5;
        let agent = Arc::new(agent);
        let controller = DownloadController::new(unused_fetcher()).with_agent(agent.clone());

        let started = tokio::time::Instant::now();
        let err = controller.run(&request("unused".into())).await.unwrap_err();
        assert!(matches!(err, TransferError::Hung { polls: 30 }));
        assert_eq!(agent.polls.load(Ordering::SeqCst), 31);
        assert!(started.elapsed() >= Duration::from_secs(31));
        assert_eq!(agent.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_error_after_init_is_terminal() {
        let fetcher = Arc::new(MemoryFetcher::new(b"data").0);
        let agent = Arc::new(ScriptedAgent::new(vec![
            at(10),
            Err(TransferError::Transient("agent lost".into())),
        ]));
        let controller = DownloadController::new(fetcher.clone()).with_agent(agent);

        let err = controller.run(&request("unused".into())).await.unwrap_err();
        assert!(matches!(err, TransferError::Transient(_)));
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_checked_before_each_poll_and_forwarded() {
        let agent = Arc::new(ScriptedAgent::new(vec![at(10), at(20)]));
        let controller = DownloadController::new(unused_fetcher()).with_agent(agent.clone());
        let cancel = controller.cancel_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            cancel.cancel();
        });
        let err = controller.run(&request("unused".into())).await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(agent.polls.load(Ordering::SeqCst), 2);
        assert_eq!(agent.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_agent_init_falls_back_to_whole_blob() {
        let dir = tempfile::tempdir().unwrap();
        let plaintext = vec![42u8; 70_000];
        let (fetcher, sealed) = MemoryFetcher::new(&plaintext);
        let fetcher = Arc::new(fetcher);
        let mut agent = ScriptedAgent::new(Vec::new());
        agent.init_error = true;
        let (tx, mut rx) = mpsc::channel(8);

        let controller = DownloadController::new(fetcher.clone())
            .with_agent(Arc::new(agent))
            .with_events(tx);
        let dest = dir.path().join("out.bin");
        let outcome = controller.run(&request(dest.clone())).await.unwrap();

        assert_eq!(outcome.strategy, DownloadStrategy::WholeBlob);
        assert_eq!(outcome.bytes, sealed.len() as u64);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), plaintext);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        assert!(matches!(rx.recv().await, Some(DownloadEvent::FellBack { .. })));
    }

    #[tokio::test]
    async fn spawned_agent_streams_and_decrypts_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let plaintext: Vec<u8> = (0..150_000).map(|i| (i % 97) as u8).collect();
        let (fetcher, sealed) = MemoryFetcher::new(&plaintext);
        let fetcher: Arc<dyn BlobFetcher> = Arc::new(fetcher);

        let controller = DownloadController::new(fetcher.clone())
            .with_agent(Arc::new(spawn_agent(fetcher)))
            .with_poll_interval(Duration::from_millis(20));
        let dest = dir.path().join("streamed.bin");
        let outcome = controller.run(&request(dest.clone())).await.unwrap();

        assert_eq!(outcome.strategy, DownloadStrategy::Streaming);
        assert_eq!(outcome.bytes, sealed.len() as u64);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), plaintext);
    }

    #[tokio::test]
    async fn spawned_agent_reports_missing_job() {
        let agent = spawn_agent(unused_fetcher());
        assert!(matches!(agent.progress().await, Err(TransferError::NotFound(_))));
        agent.cancel().await.unwrap();
    }
}
