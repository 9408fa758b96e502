use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ErrorCode, HealthStatus, SecurityConfig};

// -- Init --

/// Client-declared description of the file being uploaded.
///
/// `metadata` is an encrypted blob; the server never interprets it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub size: Option<u64>,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub file_metadata: FileMetadata,
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(default)]
    pub bearer: Option<String>,
    /// Seconds until the finished artifact expires.
    #[serde(default)]
    pub time_limit: Option<u64>,
    #[serde(default)]
    pub dlimit: Option<u32>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub security_config: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub upload_id: String,
    /// File id of the artifact once finalized.
    pub id: String,
    pub url: String,
    pub owner_token: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub session_id: Option<String>,
}

// -- Chunks --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub upload_id: String,
    pub chunk_index: u32,
    pub received_chunks: u32,
    pub total_chunks: Option<u32>,
    pub is_complete: bool,
}

// -- Finalize --

/// Client-side measurements reported alongside finalize.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetrics {
    pub duration_ms: u64,
    pub retries: u32,
    pub average_speed_bps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub upload_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub total_chunks: u32,
    #[serde(default)]
    pub total_size: Option<u64>,
    #[serde(default)]
    pub integrity_hashes: Vec<String>,
    #[serde(default)]
    pub metrics: Option<TransferMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub file_id: String,
    pub url: String,
    pub size: u64,
    pub chunks: u32,
    /// Milliseconds from init to finalize.
    pub duration: u64,
}

// -- Cleanup / status / health --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub received_chunks: u32,
    pub total_chunks: Option<u32>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub progress: f64,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub active_uploads: u64,
    pub total_uploads: u64,
    pub error_rate: f64,
}

// -- Errors --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u32>,
}
