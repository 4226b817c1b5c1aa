//! Batched point uploads.
//!
//! Pending points flow to the remote store in bounded batches. The network
//! round trip happens outside the store lock so new samples keep getting
//! throttled and queued while an upload is in flight. A failed batch leaves
//! the queue untouched; retry is external, via the periodic flush timer and
//! the explicit flushes at pause()/end().

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::remote::RemoteStore;
use crate::store::SessionStore;
use crate::UploadConfig;

/// Store handle shared between the controller and the uploader.
pub type SharedStore = Arc<Mutex<SessionStore>>;

/// Flushes pending route points to the remote store in bounded batches.
pub struct BatchUploader {
    store: SharedStore,
    remote: Arc<dyn RemoteStore>,
    config: UploadConfig,
}

impl BatchUploader {
    pub fn new(store: SharedStore, remote: Arc<dyn RemoteStore>, config: UploadConfig) -> Self {
        Self {
            store,
            remote,
            config,
        }
    }

    /// Submit up to `batch_size` pending points in queue order.
    ///
    /// On acknowledgment, exactly the submitted points are removed from
    /// the durable queue. Because the remote insert is idempotent per
    /// (session id, sequence), re-submission after a lost ack is a no-op
    /// on the server. Returns the number of points confirmed this call.
    pub async fn flush(&self, session_id: &str) -> Result<usize> {
        let batch = {
            let store = self.store.lock().await;
            store.pending_batch(session_id, self.config.batch_size)?
        };

        if batch.is_empty() {
            debug!("[BatchUploader] Nothing pending for session {}", session_id);
            return Ok(0);
        }

        let sequences: Vec<u32> = batch.iter().map(|p| p.sequence).collect();
        let submitted = batch.len();

        match self.remote.batch_insert_points(session_id, &batch).await {
            Ok(inserted) => {
                let mut store = self.store.lock().await;
                store.remove_pending(session_id, &sequences)?;
                info!(
                    "[BatchUploader] Flushed {} points for session {} ({} newly inserted)",
                    submitted, session_id, inserted
                );
                Ok(submitted)
            }
            Err(e) => {
                warn!(
                    "[BatchUploader] Batch of {} failed for session {}: {}",
                    submitted, session_id, e
                );
                Err(e)
            }
        }
    }

    /// Keep flushing until the queue is empty or a batch fails. Used for
    /// the single bounded drain at pause()/end().
    pub async fn drain(&self, session_id: &str) -> Result<usize> {
        let mut total = 0;
        loop {
            let flushed = self.flush(session_id).await?;
            if flushed == 0 {
                return Ok(total);
            }
            total += flushed;
        }
    }
}
