//! Queue entry points: submit, trigger, drain, status and retention.
//!
//! This is what the HTTP layer calls. Everything here is wired from the same store,
//! clock and config so the components agree on versions, time and limits.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use drainq_core::{Clock, JobId, OwnerId};
use drainq_extract::{ExtractionPipeline, Extractor, FieldSet};

use crate::config::QueueConfig;

use super::continuation::ContinuationSink;
use super::dispatch::{DispatchChain, InvocationReport};
use super::reclaimer::{ReclaimReport, Reclaimer};
use super::retention::{RetentionReport, RetentionSweeper};
use super::status::{OwnerStatus, StatusAggregator};
use super::store::{JobStore, JobStoreError, TimedJobStore};
use super::types::{Job, JobPayload};

/// Largest accepted job text, in bytes.
pub const MAX_TEXT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid job: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Trigger acknowledgement. Describes what the trigger set in motion, never the
/// outcome of any job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriggerAck {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclaim: Option<ReclaimReport>,
    pub continuation_emitted: bool,
}

#[derive(Clone)]
pub struct QueueService {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    reclaimer: Reclaimer,
    chain: Arc<DispatchChain>,
    status: StatusAggregator,
    retention: RetentionSweeper,
}

impl QueueService {
    /// Wire the queue. Every store call is bounded by `config.store_timeout`, every
    /// extraction by `config.extract_deadline`.
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        primary: Arc<dyn Extractor>,
        sink: Arc<dyn ContinuationSink>,
        config: QueueConfig,
    ) -> Self {
        let store: Arc<dyn JobStore> = Arc::new(TimedJobStore::new(store, config.store_timeout));
        let pipeline = ExtractionPipeline::new(primary, config.extract_deadline).with_policy(config.fallback);
        let window = config.liveness_window_chrono();

        Self {
            reclaimer: Reclaimer::new(store.clone(), clock.clone(), window, config.retry_policy()),
            chain: Arc::new(DispatchChain::new(
                store.clone(),
                clock.clone(),
                pipeline,
                sink,
                config.clone(),
            )),
            status: StatusAggregator::new(store.clone(), clock.clone(), window),
            retention: RetentionSweeper::new(store.clone(), clock.clone(), config.retention_chrono()),
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The dispatch chain, for wiring a continuation worker.
    pub fn chain(&self) -> Arc<DispatchChain> {
        self.chain.clone()
    }

    /// Queue a new job for `owner`.
    #[instrument(skip(self, owner, text, fields), fields(owner = %owner), err)]
    pub async fn submit(&self, owner: OwnerId, text: String, fields: FieldSet) -> Result<Job, SubmitError> {
        if text.trim().is_empty() {
            return Err(SubmitError::Invalid("text is empty".into()));
        }
        if text.len() > MAX_TEXT_BYTES {
            return Err(SubmitError::Invalid(format!(
                "text is {} bytes; the limit is {MAX_TEXT_BYTES}",
                text.len()
            )));
        }

        let job = Job::new(owner, JobPayload::new(text, fields), self.clock.now());
        let job = self.store.insert(job).await?;
        info!(job_id = %job.id, "job queued");
        Ok(job)
    }

    /// Reclaim stuck jobs, then ask for a drain. Never runs extraction inline and
    /// never fails: problems are reported in the acknowledgement.
    #[instrument(skip(self, owner), fields(owner = %owner))]
    pub async fn trigger(&self, owner: &OwnerId, job_id: Option<JobId>) -> TriggerAck {
        if let Some(job_id) = job_id {
            match self.store.get(job_id).await {
                Ok(Some(job)) if &job.owner == owner => {}
                Ok(Some(_)) => return rejected(format!("job {job_id} belongs to another owner")),
                Ok(None) => return rejected(format!("job {job_id} not found")),
                Err(e) => warn!(job_id = %job_id, error = %e, "could not verify triggering job"),
            }
        }

        let reclaim = match self.reclaimer.reclaim(owner).await {
            Ok(report) => Some(report),
            Err(e) => {
                // The drain can still make progress on queued work.
                warn!(error = %e, "reclaim sweep failed");
                None
            }
        };

        let continuation_emitted = self.chain.request_continuation(owner).await;
        TriggerAck {
            accepted: true,
            reason: None,
            reclaim,
            continuation_emitted,
        }
    }

    /// Run one budgeted invocation here. This is the continuation target.
    pub async fn drain(&self, owner: &OwnerId, chain_depth: u32) -> Result<InvocationReport, JobStoreError> {
        self.chain.run_invocation(owner, chain_depth).await
    }

    pub async fn status(&self, owner: &OwnerId) -> Result<OwnerStatus, JobStoreError> {
        self.status.status(owner).await
    }

    pub async fn job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(job_id).await
    }

    pub async fn retention(&self) -> Result<RetentionReport, JobStoreError> {
        self.retention.sweep().await
    }
}

fn rejected(reason: String) -> TriggerAck {
    TriggerAck {
        accepted: false,
        reason: Some(reason),
        ..TriggerAck::default()
    }
}
