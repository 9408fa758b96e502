use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parcel_transfer::TransferError;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything the store keeps next to a finished artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeta {
    pub metadata: String,
    pub authorization: String,
    pub owner_token: String,
    pub name: String,
    pub content_type: String,
    pub expires_at: DateTime<Utc>,
    pub downloads_left: u32,
    pub size: u64,
}

impl BlobMeta {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at || self.downloads_left == 0
    }
}

/// A readable artifact plus its metadata.
pub struct OpenBlob {
    pub meta: BlobMeta,
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
}

/// Durable key/value storage for finalized uploads.
pub trait BlobStore: Send + Sync {
    /// Stores `data` under `id`. Nothing is visible under `id` unless this succeeds.
    fn put<'a>(&'a self, id: &'a str, data: Bytes, meta: BlobMeta)
        -> BoxFuture<'a, Result<(), TransferError>>;

    /// Removes the artifact. Deleting an absent id succeeds.
    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), TransferError>>;

    /// Opens a live artifact. Expired artifacts are removed and reported absent.
    fn open<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<OpenBlob>, TransferError>>;

    /// Consumes one download. Returns the downloads left, `None` if absent.
    /// The artifact is deleted once none remain.
    fn record_download<'a>(&'a self, id: &'a str)
        -> BoxFuture<'a, Result<Option<u32>, TransferError>>;

    /// Deletes every expired artifact and returns how many went.
    fn purge_expired(&self) -> BoxFuture<'_, Result<usize, TransferError>>;
}

const META_SUFFIX: &str = ".meta.json";
const PART_SUFFIX: &str = ".part";

/// Flat directory store: `{dir}/{id}` holds the bytes and
/// `{dir}/{id}.meta.json` the [`BlobMeta`].
pub struct DiskBlobStore {
    dir: PathBuf,
    // serializes read-modify-write of meta files
    meta_lock: Mutex<()>,
}

impl DiskBlobStore {
    pub async fn new(dir: PathBuf) -> Result<Self, TransferError> {
        fs::create_dir_all(&dir).await?;
        info!("Blob storage directory: {}", dir.display());
        Ok(Self {
            dir,
            meta_lock: Mutex::new(()),
        })
    }

    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, META_SUFFIX))
    }

    fn part_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, PART_SUFFIX))
    }

    async fn read_meta(&self, id: &str) -> Result<Option<BlobMeta>, TransferError> {
        match fs::read(self.meta_path(id)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| TransferError::Internal(format!("corrupt metadata for {}: {}", id, e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_meta(&self, id: &str, meta: &BlobMeta) -> Result<(), TransferError> {
        let raw = serde_json::to_vec(meta).map_err(|e| TransferError::Internal(e.to_string()))?;
        fs::write(self.meta_path(id), raw).await?;
        Ok(())
    }

    async fn write_blob(&self, id: &str, data: &[u8], meta: &BlobMeta) -> Result<(), TransferError> {
        let part = self.part_path(id);
        let mut file = fs::File::create(&part).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        self.write_meta(id, meta).await?;
        fs::rename(&part, self.blob_path(id)).await?;
        Ok(())
    }

    async fn remove_files(&self, id: &str) -> Result<(), TransferError> {
        let mut removed = false;
        for path in [self.blob_path(id), self.meta_path(id), self.part_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed {
            info!("Deleted blob {}", id);
        } else {
            debug!("Blob {} already gone", id);
        }
        Ok(())
    }
}

impl BlobStore for DiskBlobStore {
    fn put<'a>(&'a self, id: &'a str, data: Bytes, meta: BlobMeta)
        -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            if let Err(e) = self.write_blob(id, &data, &meta).await {
                warn!("Failed to store blob {}: {}", id, e);
                if let Err(cleanup) = self.remove_files(id).await {
                    warn!("Failed to remove partial blob {}: {}", id, cleanup);
                }
                return Err(e);
            }
            info!("Stored blob {} ({} bytes)", id, data.len());
            Ok(())
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let _guard = self.meta_lock.lock().await;
            self.remove_files(id).await
        })
    }

    fn open<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<OpenBlob>, TransferError>> {
        Box::pin(async move {
            let Some(meta) = self.read_meta(id).await? else {
                return Ok(None);
            };
            if meta.is_expired(Utc::now()) {
                let _guard = self.meta_lock.lock().await;
                self.remove_files(id).await?;
                return Ok(None);
            }
            match fs::File::open(self.blob_path(id)).await {
                Ok(file) => Ok(Some(OpenBlob {
                    meta,
                    reader: Box::pin(file),
                })),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn record_download<'a>(&'a self, id: &'a str)
        -> BoxFuture<'a, Result<Option<u32>, TransferError>> {
        Box::pin(async move {
            let _guard = self.meta_lock.lock().await;
            let Some(mut meta) = self.read_meta(id).await? else {
                return Ok(None);
            };
            meta.downloads_left = meta.downloads_left.saturating_sub(1);
            if meta.downloads_left == 0 {
                self.remove_files(id).await?;
            } else {
                self.write_meta(id, &meta).await?;
            }
            Ok(Some(meta.downloads_left))
        })
    }

    fn purge_expired(&self) -> BoxFuture<'_, Result<usize, TransferError>> {
        Box::pin(async move {
            let now = Utc::now();
            let mut ids = Vec::new();
            let mut entries = fs::read_dir(&self.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(id) = entry.file_name().to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) {
                    ids.push(id.to_string());
                }
            }

            let mut purged = 0;
            for id in ids {
                let _guard = self.meta_lock.lock().await;
                match self.read_meta(&id).await {
                    Ok(Some(meta)) if meta.is_expired(now) => {
                        self.remove_files(&id).await?;
                        purged += 1;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Skipping blob {} during purge: {}", id, e),
                }
            }
            Ok(purged)
        })
    }
}
