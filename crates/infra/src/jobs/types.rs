//! Core job types and the job state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use drainq_core::{DomainError, DomainResult, JobId, OwnerId};
use drainq_extract::{FieldSet, StructuredResult};

/// Job status.
///
/// ```text
/// queued ──claim──▶ claimed ──success──▶ done
///    ▲                 │  └───failure, budget spent──▶ dead
///    └──failure, budget left──┘
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Reserved by exactly one executor
    Claimed,
    /// Finished with a result (terminal)
    Done,
    /// Finished without a result (terminal)
    Dead,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::Done => "done",
            JobStatus::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "claimed" => Ok(JobStatus::Claimed),
            "done" => Ok(JobStatus::Done),
            "dead" => Ok(JobStatus::Dead),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Immutable job input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub text: String,
    pub fields: FieldSet,
}

impl JobPayload {
    pub fn new(text: impl Into<String>, fields: FieldSet) -> Self {
        Self {
            text: text.into(),
            fields,
        }
    }
}

/// Terminal outcome, written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        result: StructuredResult,
        /// Produced by the local fallback extractor instead of the primary.
        degraded: bool,
    },
    Failure {
        error: String,
    },
}

/// Failures that end up in `outcome.error` or `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("critical failure while processing job: {0}")]
    Critical(String),

    #[error("claimed for {elapsed_secs}s without completing (liveness window {window_secs}s)")]
    Abandoned { elapsed_secs: i64, window_secs: i64 },
}

/// Retry budget.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of claim cycles a job may consume (>= 1).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// May a job that has now failed `failed_cycles` times go back to the queue?
    pub fn should_retry(&self, failed_cycles: u32) -> bool {
        failed_cycles < self.max_attempts
    }
}

/// What a failed claim cycle did to the job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureTransition {
    /// `claimed → queued`, `attempt` incremented.
    Reset { attempt: u32 },
    /// `claimed → dead`, `attempt` incremented.
    Killed { attempt: u32 },
}

/// A queued extraction job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Submitting user; scopes every query
    pub owner: OwnerId,
    /// Input text and requested fields
    pub payload: JobPayload,
    /// Current status
    pub status: JobStatus,
    /// Ordering key (ties broken by `id`); never rewritten, not even by a reset
    pub enqueued_at: DateTime<Utc>,
    /// When the current claim was taken; `None` unless claimed
    pub claimed_at: Option<DateTime<Utc>>,
    /// Failed claim cycles so far
    pub attempt: u32,
    /// Set once, on the terminal transition
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once, on the terminal transition
    pub outcome: Option<Outcome>,
    /// Why the most recent cycle failed (kept across resets for operators)
    pub last_error: Option<String>,
    /// Store-managed revision for compare-and-set; 0 until first persisted
    pub version: u64,
}

impl Job {
    /// Create a new queued job.
    pub fn new(owner: OwnerId, payload: JobPayload, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            owner,
            payload,
            status: JobStatus::Queued,
            enqueued_at,
            claimed_at: None,
            attempt: 0,
            completed_at: None,
            outcome: None,
            last_error: None,
            version: 0,
        }
    }

    /// FIFO ordering key.
    pub fn order_key(&self) -> (DateTime<Utc>, JobId) {
        (self.enqueued_at, self.id)
    }

    fn ensure_status(&self, expected: JobStatus, action: &str) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "cannot {action} job {}: already {}",
                self.id, self.status
            )));
        }
        if self.status != expected {
            return Err(DomainError::invariant(format!(
                "cannot {action} job {}: status is {}, expected {}",
                self.id, self.status, expected
            )));
        }
        Ok(())
    }

    /// `queued → claimed`.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_status(JobStatus::Queued, "claim")?;
        self.status = JobStatus::Claimed;
        self.claimed_at = Some(now);
        Ok(())
    }

    /// `claimed → done`.
    pub fn complete(&mut self, result: StructuredResult, degraded: bool, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_status(JobStatus::Claimed, "complete")?;
        self.status = JobStatus::Done;
        self.completed_at = Some(now);
        self.outcome = Some(Outcome::Success { result, degraded });
        Ok(())
    }

    /// `claimed → queued` or `claimed → dead`, depending on the retry budget.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<FailureTransition> {
        self.ensure_status(JobStatus::Claimed, "fail")?;
        let error = error.into();
        let next = self.attempt.saturating_add(1);
        self.attempt = next;
        self.claimed_at = None;

        if policy.should_retry(next) {
            self.status = JobStatus::Queued;
            self.last_error = Some(error);
            Ok(FailureTransition::Reset { attempt: next })
        } else {
            let exhausted = JobError::RetriesExhausted {
                attempts: next,
                last_error: error.clone(),
            };
            self.status = JobStatus::Dead;
            self.completed_at = Some(now);
            self.outcome = Some(Outcome::Failure {
                error: exhausted.to_string(),
            });
            self.last_error = Some(error);
            Ok(FailureTransition::Killed { attempt: next })
        }
    }

    /// Would a failure of the current claim cycle exhaust the budget?
    pub fn is_final_attempt(&self, policy: &RetryPolicy) -> bool {
        !policy.should_retry(self.attempt.saturating_add(1))
    }

    /// Claimed for strictly longer than `window`.
    pub fn is_stuck(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.status == JobStatus::Claimed
            && self.claimed_at.is_some_and(|at| now - at > window)
    }

    /// Seconds since the current claim was taken.
    pub fn claim_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.claimed_at.map(|at| now - at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drainq_extract::{Field, FieldSet};
    use std::collections::BTreeMap;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn job() -> Job {
        Job::new(
            OwnerId::parse("u1").unwrap(),
            JobPayload::new("Ada Lovelace", FieldSet::new([Field::Name]).unwrap()),
            t(0),
        )
    }

    fn result() -> StructuredResult {
        StructuredResult::complete(&FieldSet::new([Field::Name]).unwrap(), BTreeMap::new())
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(3);

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn zero_max_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }

    #[test]
    fn job_lifecycle() {
        let mut job = job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 0);

        job.claim(t(1)).unwrap();
        assert_eq!(job.status, JobStatus::Claimed);
        assert_eq!(job.attempt, 0, "a fresh claim never bumps attempt");

        job.complete(result(), false, t(2)).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.completed_at, Some(t(2)));
        assert!(matches!(job.outcome, Some(Outcome::Success { degraded: false, .. })));
    }

    #[test]
    fn permanently_failing_job_dies_after_max_attempts() {
        let policy = RetryPolicy::new(2);
        let mut job = job();

        job.claim(t(1)).unwrap();
        assert_eq!(job.fail("boom", &policy, t(2)).unwrap(), FailureTransition::Reset { attempt: 1 });
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.claimed_at, None);
        assert_eq!(job.enqueued_at, t(0), "reset keeps the original ordering key");

        job.claim(t(3)).unwrap();
        assert!(job.is_final_attempt(&policy));
        assert_eq!(job.fail("boom", &policy, t(4)).unwrap(), FailureTransition::Killed { attempt: 2 });
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.attempt, 2);
        match &job.outcome {
            Some(Outcome::Failure { error }) => assert!(error.contains("retries exhausted after 2")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn terminal_jobs_reject_every_transition() {
        let policy = RetryPolicy::default();
        let mut job = job();
        job.claim(t(1)).unwrap();
        job.complete(result(), false, t(2)).unwrap();
        let snapshot = job.clone();

        assert!(job.claim(t(3)).is_err());
        assert!(job.complete(result(), true, t(3)).is_err());
        assert!(job.fail("late", &policy, t(3)).is_err());
        assert_eq!(job, snapshot);
    }

    #[test]
    fn stuck_means_strictly_older_than_window() {
        let mut job = job();
        job.claim(t(100)).unwrap();

        assert!(!job.is_stuck(t(160), Duration::seconds(60)));
        assert!(job.is_stuck(t(161), Duration::seconds(60)));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [JobStatus::Queued, JobStatus::Claimed, JobStatus::Done, JobStatus::Dead] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Step {
            Claim,
            Complete,
            Fail,
        }

        fn step() -> impl Strategy<Value = Step> {
            prop_oneof![Just(Step::Claim), Just(Step::Complete), Just(Step::Fail)]
        }

        fn run(job: &mut Job, step: &Step, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
            match step {
                Step::Claim => job.claim(now).is_ok(),
                Step::Complete => job.complete(result(), false, now).is_ok(),
                Step::Fail => job.fail("boom", policy, now).is_ok(),
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Once done or dead, no sequence of operations changes the job.
            #[test]
            fn terminal_jobs_never_change(
                max_attempts in 1u32..5,
                steps in proptest::collection::vec(step(), 1..40),
            ) {
                let policy = RetryPolicy::new(max_attempts);
                let mut job = job();
                let mut frozen: Option<Job> = None;

                for (i, step) in steps.iter().enumerate() {
                    let applied = run(&mut job, step, &policy, t(i as i64 + 1));
                    if let Some(snapshot) = &frozen {
                        prop_assert!(!applied);
                        prop_assert_eq!(&job, snapshot);
                    } else if job.status.is_terminal() {
                        frozen = Some(job.clone());
                    }
                }
            }

            /// Attempts only grow, never pass the budget, and a dead job used all of it.
            #[test]
            fn attempts_stay_within_budget(
                max_attempts in 1u32..5,
                steps in proptest::collection::vec(step(), 1..40),
            ) {
                let policy = RetryPolicy::new(max_attempts);
                let mut job = job();
                let mut last = 0;

                for (i, step) in steps.iter().enumerate() {
                    run(&mut job, step, &policy, t(i as i64 + 1));
                    prop_assert!(job.attempt >= last);
                    prop_assert!(job.attempt <= max_attempts);
                    prop_assert_eq!(job.enqueued_at, t(0));
                    last = job.attempt;
                }
                if job.status == JobStatus::Dead {
                    prop_assert_eq!(job.attempt, max_attempts);
                }
            }
        }
    }
}
