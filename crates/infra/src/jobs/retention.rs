//! Retention sweep: delete terminal jobs older than the retention window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use drainq_core::{Clock, ExpectedVersion};

use super::store::{BatchWrite, JobStore, JobStoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub deleted: usize,
    pub batches: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
        }
    }

    /// Delete, batch by batch, every `done`/`dead` job completed before
    /// `now - retention`. Each delete is conditioned on the version that was listed.
    #[instrument(skip(self), err)]
    pub async fn sweep(&self) -> Result<RetentionReport, JobStoreError> {
        // A window reaching past the earliest representable instant keeps everything.
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let limit = self.store.batch_limit().max(1);
        let mut report = RetentionReport::default();

        loop {
            let expired = self.store.list_terminal_before(cutoff, limit).await?;
            if expired.is_empty() {
                break;
            }
            let listed = expired.len();

            let writes = expired
                .into_iter()
                .map(|job| BatchWrite::Delete {
                    job_id: job.id,
                    expected: ExpectedVersion::Exact(job.version),
                })
                .collect();
            let results = self.store.write_batch(writes).await?;
            report.batches += 1;

            let mut deleted = 0;
            for result in results {
                match result {
                    Ok(()) => deleted += 1,
                    Err(JobStoreError::NotFound(_)) => {}
                    Err(e) => {
                        warn!(error = %e, "failed to delete expired job");
                        report.errors += 1;
                    }
                }
            }
            report.deleted += deleted;

            // A short page is the last one; a page with no progress would repeat forever.
            if listed < limit || deleted == 0 {
                break;
            }
        }

        info!(
            deleted = report.deleted,
            batches = report.batches,
            errors = report.errors,
            cutoff = %cutoff,
            "retention sweep finished"
        );
        Ok(report)
    }
}
