//! Transaction snapshot manager
//!
//! One manager exists per run and is shared with every branch of that run,
//! so the "one live snapshot per run" rule holds across concurrent branches.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::repository::{RecordStore, SnapshotHandle};
use crate::CoreError;

/// Tracks the single open snapshot of a run
pub struct TransactionManager {
    records: Arc<dyn RecordStore>,
    open: Mutex<Option<SnapshotHandle>>,
}

impl TransactionManager {
    /// Create a manager over the run's record store
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            open: Mutex::new(None),
        }
    }

    /// Take a snapshot of every collection
    pub async fn begin(&self) -> Result<SnapshotHandle, CoreError> {
        let mut open = self.open.lock().await;
        if let Some(current) = open.as_ref() {
            return Err(CoreError::NestedTransactionError(format!(
                "Snapshot {} is already open for this run",
                current.0
            )));
        }

        let handle = self.records.snapshot().await?;
        debug!(snapshot = %handle.0, "transaction snapshot taken");
        *open = Some(handle.clone());
        Ok(handle)
    }

    /// Discard the snapshot, keeping the block's mutations
    pub async fn commit(&self, handle: &SnapshotHandle) -> Result<(), CoreError> {
        self.release(handle).await?;
        self.records.discard(handle).await?;
        debug!(snapshot = %handle.0, "transaction committed");
        Ok(())
    }

    /// Restore every collection to its pre-block contents
    pub async fn rollback(&self, handle: &SnapshotHandle) -> Result<(), CoreError> {
        self.release(handle).await?;
        if let Err(err) = self.records.restore(handle).await {
            warn!(snapshot = %handle.0, error = %err, "transaction restore failed");
            return Err(err);
        }
        debug!(snapshot = %handle.0, "transaction rolled back");
        Ok(())
    }

    /// Whether a snapshot is currently open
    pub async fn is_open(&self) -> bool {
        self.open.lock().await.is_some()
    }

    async fn release(&self, handle: &SnapshotHandle) -> Result<(), CoreError> {
        let mut open = self.open.lock().await;
        match open.as_ref() {
            Some(current) if current == handle => {
                *open = None;
                Ok(())
            }
            _ => Err(CoreError::StoreError(format!(
                "Snapshot {} is not the open snapshot of this run",
                handle.0
            ))),
        }
    }
}
