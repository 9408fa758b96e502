/// Parcel transfer core, shared by the server and the client.
///
/// Provides:
/// - Stream chunker that cuts a byte stream into fixed-size chunks
///   while buffering at most one chunk
/// - Per-chunk digests (SHA-1 / SHA-256 / SHA-384 / SHA-512)
/// - Retry policy with exponential backoff
/// - Rolling transfer speed meter
/// - The error taxonomy both sides speak

pub mod chunker;
pub mod error;
pub mod hash;
pub mod retry;
pub mod speed;

pub use chunker::{Chunk, Chunker, chunk_count, chunk_stream};
pub use error::TransferError;
pub use hash::{digest_hex, verify_digest};
pub use retry::RetryPolicy;
pub use speed::SpeedMeter;

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Default number of chunk uploads kept in flight.
pub const DEFAULT_MAX_PARALLEL_CHUNKS: usize = 3;

/// Default retries per chunk (attempts = retries + 1).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
