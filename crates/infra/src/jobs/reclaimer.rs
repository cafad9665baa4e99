//! Stuck-job reclaimer.
//!
//! An executor that dies mid-job leaves its claim behind. Nothing runs in the
//! background to notice; instead every trigger sweeps the owner's claimed jobs and
//! resolves the ones older than the liveness window through the normal failure rule.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{info, instrument, warn};

use drainq_core::{Clock, ExpectedVersion, OwnerId};

use super::store::{BatchWrite, JobQuery, JobStore, JobStoreError};
use super::types::{FailureTransition, JobError, JobStatus, RetryPolicy};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Claimed jobs examined.
    pub scanned: usize,
    /// Put back in the queue.
    pub reset: usize,
    /// Out of retries, now dead.
    pub killed: usize,
    /// Changed by someone else between read and write.
    pub skipped: usize,
    /// Writes that failed for other reasons. They are retried by the next sweep.
    pub errors: usize,
}

#[derive(Clone)]
pub struct Reclaimer {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
    policy: RetryPolicy,
}

impl Reclaimer {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, window: Duration, policy: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            window,
            policy,
        }
    }

    /// Reset or kill every claimed job of `owner` older than the liveness window.
    ///
    /// Only the initial query can fail the sweep; write failures are counted per job.
    #[instrument(skip(self, owner), fields(owner = %owner))]
    pub async fn reclaim(&self, owner: &OwnerId) -> Result<ReclaimReport, JobStoreError> {
        let claimed = self
            .store
            .query(&JobQuery::owner(owner.clone()).with_status(JobStatus::Claimed))
            .await?;

        let now = self.clock.now();
        let mut report = ReclaimReport {
            scanned: claimed.len(),
            ..ReclaimReport::default()
        };

        let mut writes = Vec::new();
        let mut transitions = Vec::new();
        for job in claimed.into_iter().filter(|j| j.is_stuck(now, self.window)) {
            let expected = ExpectedVersion::Exact(job.version);
            let elapsed_secs = job.claim_age(now).map(|d| d.num_seconds()).unwrap_or_default();
            let reason = JobError::Abandoned {
                elapsed_secs,
                window_secs: self.window.num_seconds(),
            };

            let mut next = job;
            match next.fail(reason.to_string(), &self.policy, now) {
                Ok(transition) => {
                    transitions.push(transition);
                    writes.push(BatchWrite::Update { job: next, expected });
                }
                Err(e) => {
                    warn!(job_id = %next.id, error = %e, "stuck job rejected failure transition");
                    report.errors += 1;
                }
            }
        }

        if writes.is_empty() {
            return Ok(report);
        }

        let limit = self.store.batch_limit().max(1);
        let mut transitions = transitions.into_iter();
        let mut pending = writes.into_iter().peekable();
        while pending.peek().is_some() {
            let chunk: Vec<BatchWrite> = pending.by_ref().take(limit).collect();
            let chunk_transitions: Vec<FailureTransition> = transitions.by_ref().take(chunk.len()).collect();
            let ids: Vec<_> = chunk.iter().map(BatchWrite::job_id).collect();

            match self.store.write_batch(chunk).await {
                Ok(results) => {
                    for ((result, transition), job_id) in results.into_iter().zip(chunk_transitions).zip(ids) {
                        match (result, transition) {
                            (Ok(()), FailureTransition::Reset { attempt }) => {
                                info!(job_id = %job_id, attempt, "reclaimed stuck job");
                                report.reset += 1;
                            }
                            (Ok(()), FailureTransition::Killed { attempt }) => {
                                warn!(job_id = %job_id, attempt, "stuck job out of retries; marked dead");
                                report.killed += 1;
                            }
                            (Err(e), _) if e.is_race() => report.skipped += 1,
                            (Err(e), _) => {
                                warn!(job_id = %job_id, error = %e, "failed to reclaim stuck job");
                                report.errors += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(batch_size = ids.len(), error = %e, "reclaim batch failed");
                    report.errors += ids.len();
                }
            }
        }

        info!(
            scanned = report.scanned,
            reset = report.reset,
            killed = report.killed,
            skipped = report.skipped,
            errors = report.errors,
            "reclaim sweep finished"
        );
        Ok(report)
    }
}
