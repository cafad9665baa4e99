//! Single-winner claim of a queued job.

use tracing::debug;

use drainq_core::{Clock, ExpectedVersion, JobId, OwnerId};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobPayload, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} belongs to another owner")]
    OwnershipMismatch { job_id: JobId },

    /// Not queued, or another claimant won the race.
    #[error("job {job_id} is not claimable (status {status})")]
    NotClaimable { job_id: JobId, status: JobStatus },

    #[error(transparent)]
    Store(JobStoreError),
}

/// A job this caller now holds.
///
/// `job.version` is the claim token: the outcome write must be conditioned on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub job: Job,
}

impl ClaimedJob {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn payload(&self) -> &JobPayload {
        &self.job.payload
    }

    pub fn token(&self) -> ExpectedVersion {
        ExpectedVersion::Exact(self.job.version)
    }

    pub fn into_job(self) -> Job {
        self.job
    }
}

/// Claim `job_id` on behalf of `expected_owner`.
///
/// Read, check, then one compare-and-set on the version that was read. Of N concurrent
/// claimants at most one succeeds; the others get `NotClaimable`.
pub async fn claim(
    store: &dyn JobStore,
    clock: &dyn Clock,
    job_id: JobId,
    expected_owner: &OwnerId,
) -> Result<ClaimedJob, ClaimError> {
    let current = store
        .get(job_id)
        .await
        .map_err(ClaimError::Store)?
        .ok_or(ClaimError::NotFound(job_id))?;

    if &current.owner != expected_owner {
        return Err(ClaimError::OwnershipMismatch { job_id });
    }

    let read_version = current.version;
    let mut next = current;
    if next.claim(clock.now()).is_err() {
        return Err(ClaimError::NotClaimable {
            job_id,
            status: next.status,
        });
    }

    match store.compare_and_set(&next, ExpectedVersion::Exact(read_version)).await {
        Ok(job) => {
            debug!(job_id = %job_id, owner = %expected_owner, attempt = job.attempt, "job claimed");
            Ok(ClaimedJob { job })
        }
        Err(JobStoreError::Conflict { .. }) => {
            debug!(job_id = %job_id, "claim lost to a concurrent writer");
            Err(ClaimError::NotClaimable {
                job_id,
                status: JobStatus::Claimed,
            })
        }
        Err(JobStoreError::TerminalLocked(_)) => Err(ClaimError::NotClaimable {
            job_id,
            status: JobStatus::Done,
        }),
        Err(JobStoreError::NotFound(id)) => Err(ClaimError::NotFound(id)),
        Err(e) => Err(ClaimError::Store(e)),
    }
}
