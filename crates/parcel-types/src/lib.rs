/// Wire types shared by the parcel server and client.
///
/// Everything that crosses the HTTP boundary lives here so both sides agree
/// on field names (camelCase on the wire) and header names.

pub mod api;
pub mod models;

pub use api::*;
pub use models::{ErrorCode, HashAlgorithm, HealthStatus, SecurityConfig};

/// Header names used by the chunk upload call.
pub mod headers {
    pub const SESSION_ID: &str = "x-session-id";
    pub const UPLOAD_ID: &str = "x-upload-id";
    pub const CHUNK_INDEX: &str = "x-chunk-index";
    pub const TOTAL_CHUNKS: &str = "x-total-chunks";
    pub const CHUNK_HASH: &str = "x-chunk-hash";
    pub const HASH_ALGORITHM: &str = "x-hash-algorithm";
}
