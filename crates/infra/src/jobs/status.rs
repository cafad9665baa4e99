//! Per-owner progress snapshot. Read-only.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::instrument;

use drainq_core::{Clock, JobId, OwnerId};

use super::store::{JobQuery, JobStore, JobStoreError};
use super::types::JobStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub claimed: usize,
    pub done: usize,
    pub dead: usize,
    pub total: usize,
}

impl StatusCounts {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Claimed => self.claimed += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::Dead => self.dead += 1,
        }
        self.total += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckJob {
    pub job_id: JobId,
    pub claimed_for_secs: i64,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerStatus {
    pub owner: OwnerId,
    pub counts: StatusCounts,
    /// Finished share of all jobs, rounded down. 100 when there are none.
    pub progress_percent: u8,
    /// Some claimed job has outlived the liveness window.
    pub is_stuck: bool,
    pub stuck_jobs: Vec<StuckJob>,
    /// Work is waiting and no live claim is draining it. Stuck claims do not count
    /// as live: the drain that held them is gone.
    pub needs_dispatch: bool,
}

#[derive(Clone)]
pub struct StatusAggregator {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self { store, clock, window }
    }

    #[instrument(skip(self, owner), fields(owner = %owner), err)]
    pub async fn status(&self, owner: &OwnerId) -> Result<OwnerStatus, JobStoreError> {
        let jobs = self.store.query(&JobQuery::owner(owner.clone())).await?;
        let now = self.clock.now();

        let mut counts = StatusCounts::default();
        let mut stuck_jobs = Vec::new();
        for job in &jobs {
            counts.record(job.status);
            if job.is_stuck(now, self.window) {
                stuck_jobs.push(StuckJob {
                    job_id: job.id,
                    claimed_for_secs: job.claim_age(now).map(|d| d.num_seconds()).unwrap_or_default(),
                    attempt: job.attempt,
                });
            }
        }

        let progress_percent = if counts.total == 0 {
            100
        } else {
            ((counts.done + counts.dead) * 100 / counts.total) as u8
        };

        let live_claims = counts.claimed - stuck_jobs.len();
        Ok(OwnerStatus {
            owner: owner.clone(),
            counts,
            progress_percent,
            is_stuck: !stuck_jobs.is_empty(),
            stuck_jobs,
            needs_dispatch: counts.queued > 0 && live_claims == 0,
        })
    }
}
