use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::assembler::ChunkAssembler;

/// Background task that reclaims abandoned uploads.
///
/// Every `interval` it drops sessions idle for at least `stale_after` and
/// purges expired blobs from the store.
pub async fn run_reaper(assembler: Arc<ChunkAssembler>, interval: Duration, stale_after: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;
        sweep(&assembler, stale_after).await;
    }
}

/// One reaper pass. Returns (sessions reaped, blobs purged).
pub async fn sweep(assembler: &ChunkAssembler, stale_after: Duration) -> (usize, usize) {
    let reaped = assembler.reap_stale(stale_after).await;
    if reaped > 0 {
        info!("Reaper: dropped {} stale uploads", reaped);
    }

    let purged = match assembler.blobs().purge_expired().await {
        Ok(count) => count,
        Err(e) => {
            warn!("Reaper: blob purge failed: {}", e);
            0
        }
    };
    if purged > 0 {
        info!("Reaper: purged {} expired blobs", purged);
    }

    (reaped, purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{registry, request};
    use crate::storage::DiskBlobStore;
    use parcel_transfer::TransferError;

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_reaped_on_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = DiskBlobStore::new(dir.path().to_path_buf()).await.unwrap();
        let assembler = Arc::new(ChunkAssembler::new(Arc::new(registry()), Arc::new(blobs)));
        let id = assembler.registry().init(request(Some(8), 4)).unwrap().upload_id;

        tokio::spawn(run_reaper(
            assembler.clone(),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        ));

        tokio::time::sleep(Duration::from_secs(3000)).await;
        assert!(assembler.registry().status(&id).await.is_ok());

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert!(matches!(
            assembler.registry().status(&id).await,
            Err(TransferError::NotFound(_))
        ));
    }
}
