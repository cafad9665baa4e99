//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use drainq_core::{ExpectedVersion, JobId, OwnerId};

use super::types::{Job, JobStatus};

/// Default ceiling on writes per batch.
pub const DEFAULT_BATCH_LIMIT: usize = 500;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// The record moved on since it was read.
    #[error("version conflict on job {job_id}: expected {expected:?}, found {actual}")]
    Conflict {
        job_id: JobId,
        expected: ExpectedVersion,
        actual: u64,
    },

    /// The stored record is `done` or `dead` and can no longer be written.
    #[error("job {0} is terminal and cannot be modified")]
    TerminalLocked(JobId),

    #[error("batch of {size} writes exceeds the store limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("store operation `{operation}` timed out after {millis}ms")]
    Timeout { operation: &'static str, millis: u64 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Lost an optimistic race; the caller should re-read rather than retry blindly.
    pub fn is_race(&self) -> bool {
        matches!(self, JobStoreError::Conflict { .. } | JobStoreError::TerminalLocked(_))
    }
}

/// Owner-scoped job query. Results are ordered by `(enqueued_at, id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    pub owner: OwnerId,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn owner(owner: OwnerId) -> Self {
        Self {
            owner,
            status: None,
            limit: None,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        job.owner == self.owner && self.status.is_none_or(|s| job.status == s)
    }
}

/// One conditional write inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchWrite {
    /// Replace the record if it is still at `expected` and not terminal.
    Update { job: Job, expected: ExpectedVersion },
    /// Remove a terminal record if it is still at `expected`.
    Delete { job_id: JobId, expected: ExpectedVersion },
}

impl BatchWrite {
    pub fn job_id(&self) -> JobId {
        match self {
            BatchWrite::Update { job, .. } => job.id,
            BatchWrite::Delete { job_id, .. } => *job_id,
        }
    }
}

/// Per-entry outcome of [`JobStore::write_batch`], in input order.
pub type BatchResult = Vec<Result<(), JobStoreError>>;

/// Durable job storage.
///
/// Every mutating call is conditional: the store rejects writes against a stale
/// version, and rejects any write to a record whose stored status is terminal.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job. Returns the stored record (version 1).
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Write `job` if the stored record is at `expected` and not terminal.
    /// Returns the stored record with its bumped version.
    async fn compare_and_set(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError>;

    async fn query(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError>;

    /// Terminal jobs completed strictly before `cutoff`, oldest first.
    async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Apply up to [`JobStore::batch_limit`] conditional writes. Entries succeed or
    /// fail independently; the outer error is reserved for whole-batch failures.
    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<BatchResult, JobStoreError>;

    fn batch_limit(&self) -> usize;
}

/// Checks shared by every adapter before a conditional write.
pub(crate) fn check_writable(stored: &Job, expected: ExpectedVersion) -> Result<(), JobStoreError> {
    if stored.status.is_terminal() {
        return Err(JobStoreError::TerminalLocked(stored.id));
    }
    if !expected.matches(stored.version) {
        return Err(JobStoreError::Conflict {
            job_id: stored.id,
            expected,
            actual: stored.version,
        });
    }
    Ok(())
}

pub(crate) fn check_deletable(stored: &Job, expected: ExpectedVersion) -> Result<(), JobStoreError> {
    if !stored.status.is_terminal() || !expected.matches(stored.version) {
        return Err(JobStoreError::Conflict {
            job_id: stored.id,
            expected,
            actual: stored.version,
        });
    }
    Ok(())
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    batch_limit: usize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_batch_limit(DEFAULT_BATCH_LIMIT)
    }

    pub fn with_batch_limit(batch_limit: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            batch_limit: batch_limit.max(1),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply_update(jobs: &mut HashMap<JobId, Job>, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        let stored = jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        check_writable(stored, expected)?;

        // Same columns as the Postgres UPDATE; identity, payload and ordering stay put.
        stored.status = job.status;
        stored.claimed_at = job.claimed_at;
        stored.attempt = job.attempt;
        stored.completed_at = job.completed_at;
        stored.outcome = job.outcome.clone();
        stored.last_error = job.last_error.clone();
        stored.version += 1;
        Ok(stored.clone())
    }

    fn apply_delete(jobs: &mut HashMap<JobId, Job>, job_id: JobId, expected: ExpectedVersion) -> Result<(), JobStoreError> {
        let stored = jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        check_deletable(stored, expected)?;
        jobs.remove(&job_id);
        Ok(())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, mut job: Job) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        job.version = 1;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn compare_and_set(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        Self::apply_update(&mut jobs, job, expected)
    }

    async fn query(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut matched: Vec<Job> = jobs.values().filter(|j| query.matches(j)).cloned().collect();
        matched.sort_by_key(Job::order_key);
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.completed_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        matched.sort_by_key(|j| (j.completed_at, j.id));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<BatchResult, JobStoreError> {
        if writes.len() > self.batch_limit {
            return Err(JobStoreError::BatchTooLarge {
                size: writes.len(),
                limit: self.batch_limit,
            });
        }

        let mut jobs = self.jobs.write().unwrap();
        Ok(writes
            .iter()
            .map(|w| match w {
                BatchWrite::Update { job, expected } => Self::apply_update(&mut jobs, job, *expected).map(|_| ()),
                BatchWrite::Delete { job_id, expected } => Self::apply_delete(&mut jobs, *job_id, *expected),
            })
            .collect())
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }
}

/// Bounds every call on the wrapped store with a deadline.
///
/// A call that overruns yields `JobStoreError::Timeout`. The write may still have
/// landed; callers treat a timeout like a lost race and re-read.
#[derive(Clone)]
pub struct TimedJobStore {
    inner: Arc<dyn JobStore>,
    timeout: Duration,
}

impl TimedJobStore {
    pub fn new(inner: Arc<dyn JobStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = Result<T, JobStoreError>> + Send,
    ) -> Result<T, JobStoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "store call timed out");
                Err(JobStoreError::Timeout {
                    operation,
                    millis: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl JobStore for TimedJobStore {
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        self.bounded("insert", self.inner.insert(job)).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.bounded("get", self.inner.get(job_id)).await
    }

    async fn compare_and_set(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        self.bounded("compare_and_set", self.inner.compare_and_set(job, expected)).await
    }

    async fn query(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        self.bounded("query", self.inner.query(query)).await
    }

    async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.bounded("list_terminal_before", self.inner.list_terminal_before(cutoff, limit))
            .await
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<BatchResult, JobStoreError> {
        self.bounded("write_batch", self.inner.write_batch(writes)).await
    }

    fn batch_limit(&self) -> usize {
        self.inner.batch_limit()
    }
}
