//! Durable write path for execution records.
//!
//! Upserts are retried on transient lock contention with a fixed backoff
//! schedule. One deadline covers the whole retry budget and is owned by the
//! writer itself, so a cancelled run never interrupts an in-flight write.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::models::NodeExecution;
use super::store::ExecutionStore;
use crate::error::{Error, Result};
use crate::metrics;

/// Delay before each attempt.
pub const RETRY_DELAYS_MS: [u64; 7] = [0, 10, 20, 40, 80, 160, 320];

/// Default deadline for one `upsert` call, retries included.
pub const DEFAULT_PERSIST_DEADLINE: Duration = Duration::from_secs(2);

/// Retrying wrapper around an [`ExecutionStore`].
#[derive(Clone)]
pub struct DurableWriter {
    store: Arc<dyn ExecutionStore>,
    deadline: Duration,
}

impl DurableWriter {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            deadline: DEFAULT_PERSIST_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Upsert `record`, retrying lock/busy failures until the schedule or the
    /// deadline runs out. On expiry the last error is returned.
    pub async fn upsert(&self, record: &NodeExecution) -> Result<()> {
        let mut last_error: Option<Error> = None;
        let outcome =
            tokio::time::timeout(self.deadline, self.attempt_all(record, &mut last_error)).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    execution_id = %record.id,
                    deadline_ms = self.deadline.as_millis() as u64,
                    "Persist deadline exceeded"
                );
                Err(last_error.unwrap_or_else(|| {
                    Error::TransientStorage(format!(
                        "persisting execution {} exceeded {:?}",
                        record.id, self.deadline
                    ))
                }))
            }
        }
    }

    async fn attempt_all(
        &self,
        record: &NodeExecution,
        last_error: &mut Option<Error>,
    ) -> Result<()> {
        for (attempt, delay_ms) in RETRY_DELAYS_MS.iter().enumerate() {
            if *delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
            match self.store.upsert(record).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient_lock() => {
                    debug!(
                        execution_id = %record.id,
                        attempt,
                        error = %e,
                        "Transient lock on upsert, retrying"
                    );
                    metrics::record_store_retry();
                    *last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.take().unwrap_or_else(|| {
            Error::TransientStorage(format!("persisting execution {} kept failing", record.id))
        }))
    }
}
