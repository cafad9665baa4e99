//! Dispatch chain: claim a bounded batch, extract concurrently, record outcomes,
//! and keep going until the queue is empty or the invocation budget runs out.

use std::any::Any;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinError;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use drainq_core::{Clock, OwnerId};
use drainq_extract::{ExtractError, Extracted, ExtractionPipeline};

use crate::config::QueueConfig;

use super::claim::{ClaimError, ClaimedJob, claim};
use super::continuation::{ContinuationHandler, ContinuationRequest, ContinuationSink};
use super::store::{JobQuery, JobStore, JobStoreError};
use super::types::{FailureTransition, Job, JobError, JobStatus, RetryPolicy};

/// Result of one [`DispatchChain::drain_once`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Jobs this pass claimed and processed.
    pub dispatched: usize,
    /// Finished `done` (including degraded).
    pub succeeded: usize,
    /// Finished `done` from the fallback extractor.
    pub degraded: usize,
    /// Failed and went back to the queue.
    pub requeued: usize,
    /// Failed with no retries left.
    pub killed: usize,
    /// Outcome could not be written; the reclaimer will resolve the claim.
    pub lost: usize,
    /// Processing task panicked. Also counted in `requeued` or `killed`.
    pub critical: usize,
    /// Queued jobs were left behind.
    pub remaining: bool,
}

impl DrainReport {
    fn absorb(&mut self, other: &DrainReport) {
        self.dispatched += other.dispatched;
        self.succeeded += other.succeeded;
        self.degraded += other.degraded;
        self.requeued += other.requeued;
        self.killed += other.killed;
        self.lost += other.lost;
        self.critical += other.critical;
        self.remaining = other.remaining;
    }
}

/// Result of one budgeted invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvocationReport {
    pub chain_depth: u32,
    pub passes: usize,
    #[serde(flatten)]
    pub totals: DrainReport,
    /// A continuation was handed to the sink.
    pub continued: bool,
}

enum Resolution {
    Done { degraded: bool },
    Failed(FailureTransition),
}

#[derive(Clone)]
pub struct DispatchChain {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    pipeline: ExtractionPipeline,
    sink: Arc<dyn ContinuationSink>,
    config: QueueConfig,
    policy: RetryPolicy,
}

impl DispatchChain {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        pipeline: ExtractionPipeline,
        sink: Arc<dyn ContinuationSink>,
        config: QueueConfig,
    ) -> Self {
        let policy = config.retry_policy();
        Self {
            store,
            clock,
            pipeline,
            sink,
            config,
            policy,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Claim up to `concurrency_limit` queued jobs in FIFO order, process them
    /// concurrently and write each outcome with its claim token.
    ///
    /// An empty queue is a normal, zero-count report.
    #[instrument(skip(self, owner), fields(owner = %owner))]
    pub async fn drain_once(&self, owner: &OwnerId, concurrency_limit: usize) -> Result<DrainReport, JobStoreError> {
        let limit = self.config.clamp_concurrency(concurrency_limit);
        let candidates = self
            .store
            .query(&JobQuery::owner(owner.clone()).with_status(JobStatus::Queued).with_limit(limit))
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match claim(self.store.as_ref(), self.clock.as_ref(), candidate.id, owner).await {
                Ok(job) => claimed.push(job),
                Err(ClaimError::Store(e)) => {
                    warn!(job_id = %candidate.id, error = %e, "claim failed; skipping job");
                }
                Err(e) => debug!(job_id = %candidate.id, reason = %e, "skipping unclaimable job"),
            }
        }

        let mut report = DrainReport {
            dispatched: claimed.len(),
            ..DrainReport::default()
        };

        let mut running = Vec::with_capacity(claimed.len());
        for claimed_job in claimed {
            let pipeline = self.pipeline.clone();
            let payload = claimed_job.payload().clone();
            let final_attempt = claimed_job.job.is_final_attempt(&self.policy);
            let span = info_span!("job", job_id = %claimed_job.id(), attempt = claimed_job.job.attempt);
            let handle = tokio::spawn(
                async move { pipeline.run(&payload.text, &payload.fields, final_attempt).await }.instrument(span),
            );
            running.push((claimed_job, handle));
        }

        for (claimed_job, handle) in running {
            let outcome = handle.await;
            let job_id = claimed_job.id();
            if outcome.is_err() {
                report.critical += 1;
            }
            match self.resolve(claimed_job, outcome).await {
                Ok(Resolution::Done { degraded }) => {
                    report.succeeded += 1;
                    if degraded {
                        report.degraded += 1;
                    }
                }
                Ok(Resolution::Failed(FailureTransition::Reset { .. })) => report.requeued += 1,
                Ok(Resolution::Failed(FailureTransition::Killed { .. })) => report.killed += 1,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "could not record job outcome; leaving it to the reclaimer");
                    report.lost += 1;
                }
            }
        }

        report.remaining = match self
            .store
            .query(&JobQuery::owner(owner.clone()).with_status(JobStatus::Queued).with_limit(1))
            .await
        {
            Ok(left) => !left.is_empty(),
            Err(e) => {
                warn!(error = %e, "could not check for remaining jobs; assuming more work");
                true
            }
        };

        info!(
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            degraded = report.degraded,
            requeued = report.requeued,
            killed = report.killed,
            lost = report.lost,
            remaining = report.remaining,
            "drain pass finished"
        );
        Ok(report)
    }

    /// Turn a processing result into the job's next state and write it.
    async fn resolve(
        &self,
        claimed: ClaimedJob,
        outcome: Result<Result<Extracted, ExtractError>, JoinError>,
    ) -> Result<Resolution, JobStoreError> {
        let token = claimed.token();
        let mut job: Job = claimed.into_job();
        let now = self.clock.now();

        let resolution = match outcome {
            Ok(Ok(extracted)) => {
                let degraded = extracted.is_degraded();
                if let Some(primary) = &extracted.primary_error {
                    warn!(job_id = %job.id, error = %primary, "job completed with fallback extractor");
                }
                job.complete(extracted.result, degraded, now)
                    .map_err(|e| JobStoreError::Storage(e.to_string()))?;
                Resolution::Done { degraded }
            }
            Ok(Err(extract_error)) => {
                let transition = job
                    .fail(extract_error.to_string(), &self.policy, now)
                    .map_err(|e| JobStoreError::Storage(e.to_string()))?;
                Resolution::Failed(transition)
            }
            Err(join_error) => {
                let critical = JobError::Critical(panic_message(join_error));
                warn!(job_id = %job.id, error = %critical, "job processing panicked");
                let transition = job
                    .fail(critical.to_string(), &self.policy, now)
                    .map_err(|e| JobStoreError::Storage(e.to_string()))?;
                Resolution::Failed(transition)
            }
        };

        self.store.compare_and_set(&job, token).await?;

        match &resolution {
            Resolution::Done { degraded } => info!(job_id = %job.id, degraded, "job done"),
            Resolution::Failed(FailureTransition::Reset { attempt }) => {
                info!(job_id = %job.id, attempt, error = ?job.last_error, "job failed; requeued")
            }
            Resolution::Failed(FailureTransition::Killed { attempt }) => {
                warn!(job_id = %job.id, attempt, error = ?job.last_error, "job failed; out of retries")
            }
        }
        Ok(resolution)
    }

    /// Drain in-process while the invocation budget allows another pass, then hand
    /// leftover work to the continuation sink.
    #[instrument(skip(self, owner), fields(owner = %owner))]
    pub async fn run_invocation(&self, owner: &OwnerId, chain_depth: u32) -> Result<InvocationReport, JobStoreError> {
        let started = tokio::time::Instant::now();
        let estimate = self.config.pass_estimate(self.config.concurrency);
        let mut report = InvocationReport {
            chain_depth,
            ..InvocationReport::default()
        };

        loop {
            let pass = self.drain_once(owner, self.config.concurrency).await?;
            report.passes += 1;
            report.totals.absorb(&pass);

            if pass.dispatched == 0 || !pass.remaining {
                break;
            }

            if started.elapsed() + estimate > self.config.invocation_budget {
                report.continued = self.continue_chain(owner, chain_depth).await;
                break;
            }
        }

        info!(
            passes = report.passes,
            dispatched = report.totals.dispatched,
            remaining = report.totals.remaining,
            continued = report.continued,
            "invocation finished"
        );
        Ok(report)
    }

    async fn continue_chain(&self, owner: &OwnerId, chain_depth: u32) -> bool {
        let next_depth = chain_depth.saturating_add(1);
        if next_depth > self.config.max_chain_depth {
            warn!(
                owner = %owner,
                chain_depth,
                max = self.config.max_chain_depth,
                "chain depth cap reached; waiting for the next trigger"
            );
            return false;
        }

        let request = ContinuationRequest {
            owner: owner.clone(),
            chain_depth: next_depth,
            requested_at: self.clock.now(),
        };
        match self.sink.emit(request).await {
            Ok(()) => {
                debug!(owner = %owner, chain_depth = next_depth, "continuation emitted");
                true
            }
            Err(e) => {
                warn!(owner = %owner, error = %e, "failed to emit continuation");
                false
            }
        }
    }

    /// Ask for a fresh invocation without draining here.
    pub async fn request_continuation(&self, owner: &OwnerId) -> bool {
        let request = ContinuationRequest {
            owner: owner.clone(),
            chain_depth: 0,
            requested_at: self.clock.now(),
        };
        match self.sink.emit(request).await {
            Ok(()) => true,
            Err(e) => {
                warn!(owner = %owner, error = %e, "failed to emit continuation");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl ContinuationHandler for DispatchChain {
    async fn handle(&self, request: ContinuationRequest) {
        if let Err(e) = self.run_invocation(&request.owner, request.chain_depth).await {
            warn!(owner = %request.owner, error = %e, "continuation drain failed");
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::jobs::continuation::RecordingSink;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::testing::{fields, owner, scripted, t};
    use crate::jobs::types::{JobPayload, Outcome};
    use drainq_core::ManualClock;
    use drainq_extract::FallbackPolicy;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        clock: ManualClock,
        sink: RecordingSink,
        chain: DispatchChain,
    }

    fn harness(config: QueueConfig) -> Harness {
        let store = Arc::new(InMemoryJobStore::new());
        let clock = ManualClock::at_secs(1_000);
        let sink = RecordingSink::new();
        let pipeline = ExtractionPipeline::new(scripted(), Duration::from_millis(100)).with_policy(config.fallback);
        let chain = DispatchChain::new(
            store.clone(),
            Arc::new(clock.clone()),
            pipeline,
            Arc::new(sink.clone()),
            config,
        );
        Harness { store, clock, sink, chain }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            fallback: FallbackPolicy::Never,
            ..QueueConfig::default()
        }
    }

    async fn enqueue(h: &Harness, text: &str, at: i64) -> Job {
        let job = Job::new(owner("u1"), JobPayload::new(text, fields()), t(at));
        h.store.insert(job).await.unwrap()
    }

    #[tokio::test]
    async fn empty_queue_is_a_zero_report() {
        let h = harness(config());
        let report = h.chain.drain_once(&owner("u1"), 3).await.unwrap();
        assert_eq!(report, DrainReport::default());

        let invocation = h.chain.run_invocation(&owner("u1"), 0).await.unwrap();
        assert_eq!(invocation.passes, 1);
        assert!(!invocation.continued);
        assert!(h.sink.requests().is_empty());
    }

    #[tokio::test]
    async fn drains_in_fifo_order_up_to_the_limit() {
        let h = harness(config());
        let first = enqueue(&h, "a", 1).await;
        let second = enqueue(&h, "b", 2).await;
        let third = enqueue(&h, "c", 3).await;

        let report = h.chain.drain_once(&owner("u1"), 2).await.unwrap();
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.succeeded, 2);
        assert!(report.remaining);

        assert_eq!(h.store.get(first.id).await.unwrap().unwrap().status, JobStatus::Done);
        assert_eq!(h.store.get(second.id).await.unwrap().unwrap().status, JobStatus::Done);
        assert_eq!(h.store.get(third.id).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn timed_out_job_keeps_its_place_at_the_head() {
        let h = harness(config());
        let j1 = enqueue(&h, "slow", 0).await;
        let j2 = enqueue(&h, "ok", 1).await;

        let first = h.chain.drain_once(&owner("u1"), 1).await.unwrap();
        assert_eq!(first.requeued, 1);
        let reset = h.store.get(j1.id).await.unwrap().unwrap();
        assert_eq!((reset.status, reset.attempt, reset.enqueued_at), (JobStatus::Queued, 1, t(0)));

        // j1 still sorts first, so it is claimed again before j2.
        let second = h.chain.drain_once(&owner("u1"), 1).await.unwrap();
        assert_eq!(second.dispatched, 1);
        assert_eq!(h.store.get(j1.id).await.unwrap().unwrap().attempt, 2);
        assert_eq!(h.store.get(j2.id).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn requested_concurrency_is_clamped_to_the_ceiling() {
        let h = harness(config());
        for i in 0..8 {
            enqueue(&h, "ok", i).await;
        }
        let report = h.chain.drain_once(&owner("u1"), 100).await.unwrap();
        assert_eq!(report.dispatched, 5);
    }

    #[tokio::test]
    async fn failing_job_is_retried_then_killed() {
        let h = harness(QueueConfig {
            max_attempts: 2,
            ..config()
        });
        let job = enqueue(&h, "fail", 0).await;

        let first = h.chain.drain_once(&owner("u1"), 1).await.unwrap();
        assert_eq!(first.requeued, 1);
        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!((stored.status, stored.attempt), (JobStatus::Queued, 1));

        let second = h.chain.drain_once(&owner("u1"), 1).await.unwrap();
        assert_eq!(second.killed, 1);
        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!((stored.status, stored.attempt), (JobStatus::Dead, 2));
        assert!(matches!(stored.outcome, Some(Outcome::Failure { .. })));

        let third = h.chain.drain_once(&owner("u1"), 1).await.unwrap();
        assert_eq!(third.dispatched, 0);
    }

    #[tokio::test]
    async fn final_attempt_falls_back_and_marks_degraded() {
        let h = harness(QueueConfig {
            max_attempts: 1,
            fallback: FallbackPolicy::OnFinalAttempt,
            ..QueueConfig::default()
        });
        let job = enqueue(&h, "fail", 0).await;

        let report = h.chain.drain_once(&owner("u1"), 1).await.unwrap();
        assert_eq!((report.succeeded, report.degraded), (1, 1));

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert!(matches!(stored.outcome, Some(Outcome::Success { degraded: true, .. })));
    }

    #[tokio::test]
    async fn slow_extraction_hits_the_deadline() {
        let h = harness(config());
        let job = enqueue(&h, "slow", 0).await;

        let report = h.chain.drain_once(&owner("u1"), 1).await.unwrap();
        assert_eq!(report.requeued, 1);
        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn panicking_job_is_resolved_and_the_batch_continues() {
        let h = harness(config());
        let bad = enqueue(&h, "panic", 0).await;
        let good = enqueue(&h, "ok", 1).await;

        let report = h.chain.drain_once(&owner("u1"), 2).await.unwrap();
        assert_eq!(report.critical, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.succeeded, 1);

        let bad = h.store.get(bad.id).await.unwrap().unwrap();
        assert_eq!(bad.status, JobStatus::Queued);
        assert!(bad.last_error.unwrap().contains("critical failure"));
        assert_eq!(h.store.get(good.id).await.unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn outcome_write_after_reclaim_is_lost_not_applied() {
        let h = harness(config());
        let job = enqueue(&h, "ok", 0).await;

        // Someone else finished this claim cycle first.
        let claimed = claim(h.store.as_ref(), &h.clock, job.id, &owner("u1")).await.unwrap();
        let mut other = claimed.job.clone();
        other.fail("reclaimed", &RetryPolicy::new(3), t(2_000)).unwrap();
        h.store.compare_and_set(&other, claimed.token()).await.unwrap();

        let stale = h.chain.resolve(claimed, Ok(Err(ExtractError::upstream("late")))).await;
        assert!(matches!(stale, Err(JobStoreError::Conflict { .. })));
        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt, 1, "only the winning write counted");
    }

    #[tokio::test]
    async fn invocation_drains_everything_within_budget() {
        let h = harness(config());
        for i in 0..7 {
            enqueue(&h, "ok", i).await;
        }
        let report = h.chain.run_invocation(&owner("u1"), 0).await.unwrap();
        assert_eq!(report.totals.succeeded, 7);
        assert_eq!(report.passes, 3);
        assert!(!report.totals.remaining);
        assert!(!report.continued);
    }

    #[tokio::test]
    async fn exhausted_budget_emits_a_continuation() {
        // Every pass looks like it could overrun, so one pass then continue.
        let h = harness(QueueConfig {
            invocation_budget: Duration::from_secs(10),
            extract_deadline: Duration::from_secs(6),
            store_timeout: Duration::from_secs(3),
            ..config()
        });
        for i in 0..4 {
            enqueue(&h, "ok", i).await;
        }

        let report = h.chain.run_invocation(&owner("u1"), 4).await.unwrap();
        assert_eq!(report.passes, 1);
        assert!(report.continued);

        let requests = h.sink.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].owner, owner("u1"));
        assert_eq!(requests[0].chain_depth, 5);
    }

    #[tokio::test]
    async fn second_pass_is_refused_when_its_store_calls_could_overrun() {
        // Extraction plus two writes (80s) would fit again in 150s; 11 store calls of 10s do not.
        let h = harness(QueueConfig {
            invocation_budget: Duration::from_secs(150),
            extract_deadline: Duration::from_secs(60),
            store_timeout: Duration::from_secs(10),
            ..config()
        });
        for i in 0..4 {
            enqueue(&h, "ok", i).await;
        }

        let report = h.chain.run_invocation(&owner("u1"), 0).await.unwrap();
        assert_eq!(report.passes, 1);
        assert_eq!(report.totals.succeeded, 3);
        assert!(report.continued);
        assert_eq!(h.sink.requests()[0].chain_depth, 1);
    }

    #[tokio::test]
    async fn chain_depth_cap_stops_continuations() {
        let h = harness(QueueConfig {
            invocation_budget: Duration::from_secs(10),
            extract_deadline: Duration::from_secs(6),
            store_timeout: Duration::from_secs(3),
            max_chain_depth: 2,
            ..config()
        });
        for i in 0..4 {
            enqueue(&h, "ok", i).await;
        }

        let report = h.chain.run_invocation(&owner("u1"), 2).await.unwrap();
        assert!(!report.continued);
        assert!(h.sink.requests().is_empty());
    }

    #[tokio::test]
    async fn concurrent_drains_never_double_process() {
        let h = harness(config());
        for i in 0..10 {
            enqueue(&h, "ok", i).await;
        }

        let u1 = owner("u1");
        let (a, b) = tokio::join!(h.chain.run_invocation(&u1, 0), h.chain.run_invocation(&u1, 0));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.totals.succeeded + b.totals.succeeded, 10);
        assert_eq!(a.totals.lost + b.totals.lost, 0);
    }
}
