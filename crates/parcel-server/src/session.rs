use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parcel_transfer::TransferError;
use parcel_types::{SecurityConfig, StatusResponse};
use tokio::time::Instant;

/// A chunk as held by a session until finalize.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub data: Bytes,
    /// Digest verified on arrival, present when verification is enabled.
    pub digest: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Opaque values passed through to the blob store at finalize.
#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub metadata: String,
    pub authorization: String,
    pub name: String,
    pub content_type: String,
}

/// Server-side state of one in-progress chunked upload.
#[derive(Debug)]
pub struct TransferSession {
    pub upload_id: String,
    pub file_id: String,
    pub owner_token: String,
    pub client_session_id: Option<String>,
    pub size_estimate: u64,
    pub chunk_size: u64,
    pub estimated_chunks: u32,
    /// Set by finalize; afterwards no index at or above it is accepted.
    pub declared_chunks: Option<u32>,
    pub chunks: BTreeMap<u32, StoredChunk>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub time_limit: Duration,
    pub download_limit: u32,
    pub metadata: SessionMetadata,
    pub security: SecurityConfig,
    /// Set once the session left the store (finalized, cleaned up or reaped).
    pub closed: bool,
}

impl TransferSession {
    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Best known chunk total: declared if finalize ran, else the init
    /// estimate raised to cover the highest stored index.
    pub fn total_chunks(&self) -> Option<u32> {
        if let Some(n) = self.declared_chunks {
            return Some(n);
        }
        let seen = self.chunks.keys().next_back().map_or(0, |&i| i.saturating_add(1));
        Some(self.estimated_chunks.max(seen)).filter(|&n| n > 0)
    }

    /// Fixes the chunk total. Refused while a chunk at or past `total` is stored.
    pub fn declare_total(&mut self, total: u32) -> bool {
        if self.chunks.keys().next_back().is_some_and(|&i| i >= total) {
            return false;
        }
        self.declared_chunks = Some(total);
        true
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total_chunks(), Some(total) if total > 0 && self.received() >= total)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Stores `chunk` at `index`, replacing any earlier copy.
    pub fn store_chunk(&mut self, index: u32, chunk: StoredChunk) {
        self.chunks.insert(index, chunk);
        self.touch();
    }

    /// Concatenates chunks `0..total` in order.
    pub fn assemble(&self, total: u32) -> Result<Bytes, TransferError> {
        let size: usize = self.chunks.values().map(|c| c.data.len()).sum();
        let mut out = BytesMut::with_capacity(size);
        for index in 0..total {
            let chunk = self
                .chunks
                .get(&index)
                .ok_or(TransferError::MissingChunk(index))?;
            out.extend_from_slice(&chunk.data);
        }
        Ok(out.freeze())
    }

    pub fn status(&self) -> StatusResponse {
        let received = self.received();
        let total = self.total_chunks();
        let progress = match total {
            Some(t) if t > 0 => (received as f64 / t as f64 * 100.0).min(100.0),
            _ => 0.0,
        };
        StatusResponse {
            received_chunks: received,
            total_chunks: total,
            last_activity: self.last_activity_at,
            created_at: self.created_at,
            progress,
            is_complete: self.is_complete(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn session(estimated_chunks: u32) -> TransferSession {
        let now = Utc::now();
        TransferSession {
            upload_id: "u1".into(),
            file_id: "f1".into(),
            owner_token: "owner".into(),
            client_session_id: None,
            size_estimate: 10,
            chunk_size: 4,
            estimated_chunks,
            declared_chunks: None,
            chunks: BTreeMap::new(),
            created_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            time_limit: Duration::from_secs(60),
            download_limit: 1,
            metadata: SessionMetadata::default(),
            security: SecurityConfig::default(),
            closed: false,
        }
    }

    fn chunk(data: &'static [u8]) -> StoredChunk {
        StoredChunk {
            data: Bytes::from_static(data),
            digest: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn overwrite_keeps_cardinality() {
        let mut s = session(3);
        s.store_chunk(0, chunk(b"aaaa"));
        s.store_chunk(0, chunk(b"bbbb"));
        assert_eq!(s.received(), 1);
        assert_eq!(&s.chunks[&0].data[..], b"bbbb");
    }

    #[test]
    fn assemble_orders_by_index_and_detects_gaps() {
        let mut s = session(3);
        s.store_chunk(2, chunk(b"cc"));
        s.store_chunk(0, chunk(b"aaaa"));
        assert!(matches!(s.assemble(3), Err(TransferError::MissingChunk(1))));

        s.store_chunk(1, chunk(b"bbbb"));
        assert_eq!(&s.assemble(3).unwrap()[..], b"aaaabbbbcc");
    }

    #[test]
    fn status_reports_progress() {
        let mut s = session(4);
        s.store_chunk(0, chunk(b"x"));
        let status = s.status();
        assert_eq!(status.received_chunks, 1);
        assert_eq!(status.total_chunks, Some(4));
        assert!((status.progress - 25.0).abs() < 1e-9);
        assert!(!status.is_complete);
    }

    #[test]
    fn received_never_exceeds_the_known_total() {
        let mut s = session(3);
        for i in 0..4 {
            s.store_chunk(i, chunk(b"aaaa"));
        }
        assert_eq!(s.total_chunks(), Some(4));

        assert!(!s.declare_total(3));
        assert_eq!(s.declared_chunks, None);
        let status = s.status();
        assert!(status.received_chunks <= status.total_chunks.unwrap());

        assert!(s.declare_total(4));
        assert_eq!(s.total_chunks(), Some(4));
    }
}
