//! Buffered writer for uploads that could not be forwarded.
//!
//! Failures are buffered in memory and written to the [`BackupStore`] as one
//! batch once `batch_size` is reached, and on [`HttpBackup::flush`]. The
//! writer owns its store handle; callers only hand it records.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::registry::{BackupStore, FailedUpload, Result};

pub struct HttpBackup {
    store: Arc<dyn BackupStore>,
    batch_size: usize,
    pending: Mutex<HashMap<String, FailedUpload>>,
}

impl HttpBackup {
    pub fn new(store: Arc<dyn BackupStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer a failed upload, writing the batch once it is full.
    ///
    /// A batch whose write fails is dropped; the error is returned.
    pub async fn record_failure(&self, upload: FailedUpload) -> Result<()> {
        let batch = {
            let mut pending = self.pending.lock().await;
            pending.insert(upload.serial_number.clone(), upload);
            if pending.len() < self.batch_size {
                return Ok(());
            }
            std::mem::take(&mut *pending)
        };
        self.write(batch).await
    }

    /// Forget any backup for `serial_number`, buffered or persisted.
    pub async fn record_success(&self, serial_number: &str) -> Result<()> {
        if self.pending.lock().await.remove(serial_number).is_some() {
            debug!(serial_number = %serial_number, "Dropped buffered backup after retry succeeded");
            return Ok(());
        }
        if self.store.remove(serial_number).await? {
            info!(serial_number = %serial_number, "Removed persisted backup after retry succeeded");
        }
        Ok(())
    }

    /// Write everything buffered. Returns how many uploads were written.
    pub async fn flush(&self) -> Result<usize> {
        let batch = std::mem::take(&mut *self.pending.lock().await);
        let count = batch.len();
        if count > 0 {
            self.write(batch).await?;
        }
        Ok(count)
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn write(&self, batch: HashMap<String, FailedUpload>) -> Result<()> {
        let count = batch.len();
        self.store.write_batch(batch.into_values().collect()).await?;
        info!(count, "Wrote failed uploads to backup store");
        Ok(())
    }
}
