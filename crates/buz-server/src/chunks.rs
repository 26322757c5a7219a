//! Reassembly of audio clips uploaded as numbered parts.
//!
//! A transfer is `Open` until every index `0..total` has arrived and it is
//! assembled, or until it sits idle longer than the expiry window. Both end
//! states remove it. Expiry is enforced twice: lazily whenever a transfer is
//! touched, and by a periodic [`ChunkAssembler::purge_expired`] sweep that
//! reclaims abandoned ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use buz_shared::UploadId;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ChunkError;

#[derive(Debug)]
struct ChunkTransfer {
    total: u32,
    parts: HashMap<u32, Vec<u8>>,
    last_activity: Instant,
}

impl ChunkTransfer {
    fn new(total: u32, now: Instant) -> Self {
        Self {
            total,
            parts: HashMap::new(),
            last_activity: now,
        }
    }

    fn is_stale(&self, now: Instant, expiry: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > expiry
    }

    fn is_complete(&self) -> bool {
        self.parts.len() as u64 >= u64::from(self.total)
    }
}

#[derive(Clone)]
pub struct ChunkAssembler {
    transfers: Arc<Mutex<HashMap<UploadId, ChunkTransfer>>>,
    expiry: Duration,
}

impl ChunkAssembler {
    pub fn new(expiry: Duration) -> Self {
        Self {
            transfers: Arc::new(Mutex::new(HashMap::new())),
            expiry,
        }
    }

    /// Open a transfer of `total` parts. A retransmitted start for a transfer
    /// that is still open is ignored; returns `true` only when a new transfer
    /// was created.
    pub async fn start(&self, upload_id: &UploadId, total: u32) -> Result<bool, ChunkError> {
        self.start_at(upload_id, total, Instant::now()).await
    }

    async fn start_at(
        &self,
        upload_id: &UploadId,
        total: u32,
        now: Instant,
    ) -> Result<bool, ChunkError> {
        if total == 0 {
            return Err(ChunkError::InvalidTotal);
        }

        let mut transfers = self.transfers.lock().await;
        if let Some(existing) = transfers.get(upload_id) {
            if !existing.is_stale(now, self.expiry) {
                debug!(upload = %upload_id, "Ignoring repeated start for open transfer");
                return Ok(false);
            }
        }

        transfers.insert(upload_id.clone(), ChunkTransfer::new(total, now));
        debug!(upload = %upload_id, total, "Chunk transfer opened");
        Ok(true)
    }

    /// Store one part. The first payload for an index wins; duplicates are
    /// discarded but still count as activity. Returns whether every part has
    /// now arrived.
    pub async fn add_part(
        &self,
        upload_id: &UploadId,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<bool, ChunkError> {
        self.add_part_at(upload_id, index, bytes, Instant::now()).await
    }

    async fn add_part_at(
        &self,
        upload_id: &UploadId,
        index: u32,
        bytes: Vec<u8>,
        now: Instant,
    ) -> Result<bool, ChunkError> {
        let mut transfers = self.transfers.lock().await;

        let stale = match transfers.get(upload_id) {
            None => return Err(ChunkError::UnknownTransfer(upload_id.clone())),
            Some(transfer) => transfer.is_stale(now, self.expiry),
        };
        if stale {
            transfers.remove(upload_id);
            info!(upload = %upload_id, "Chunk transfer expired before next part");
            return Err(ChunkError::UnknownTransfer(upload_id.clone()));
        }

        let Some(transfer) = transfers.get_mut(upload_id) else {
            return Err(ChunkError::UnknownTransfer(upload_id.clone()));
        };
        if index >= transfer.total {
            return Err(ChunkError::IndexOutOfRange {
                index,
                total: transfer.total,
            });
        }

        transfer.parts.entry(index).or_insert(bytes);
        transfer.last_activity = now;
        Ok(transfer.is_complete())
    }

    /// Concatenate the parts in index order and remove the transfer. Fails
    /// without removing anything if any index is missing.
    pub async fn assemble(&self, upload_id: &UploadId) -> Result<Vec<u8>, ChunkError> {
        let mut transfers = self.transfers.lock().await;
        let transfer = transfers
            .get(upload_id)
            .ok_or_else(|| ChunkError::UnknownTransfer(upload_id.clone()))?;

        if !transfer.is_complete() || (0..transfer.total).any(|i| !transfer.parts.contains_key(&i))
        {
            return Err(ChunkError::Incomplete {
                received: transfer.parts.len(),
                total: transfer.total,
            });
        }

        let Some(mut transfer) = transfers.remove(upload_id) else {
            return Err(ChunkError::UnknownTransfer(upload_id.clone()));
        };
        let mut combined =
            Vec::with_capacity(transfer.parts.values().map(Vec::len).sum::<usize>());
        for index in 0..transfer.total {
            if let Some(part) = transfer.parts.remove(&index) {
                combined.extend_from_slice(&part);
            }
        }

        debug!(upload = %upload_id, bytes = combined.len(), "Chunk transfer assembled");
        Ok(combined)
    }

    /// Drop every transfer idle for longer than the expiry window.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now()).await
    }

    async fn purge_expired_at(&self, now: Instant) -> usize {
        let mut transfers = self.transfers.lock().await;
        let before = transfers.len();
        transfers.retain(|_, transfer| !transfer.is_stale(now, self.expiry));
        let purged = before - transfers.len();
        if purged > 0 {
            info!(purged, remaining = transfers.len(), "Purged stale chunk transfers");
        }
        purged
    }

    pub async fn open_transfers(&self) -> usize {
        self.transfers.lock().await.len()
    }
}
