//! Postgres adapter against a live database.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p drainq-infra -- --ignored`.
//! Each test uses its own owner so runs do not see each other's rows.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;

use drainq_core::{ExpectedVersion, ManualClock, OwnerId};
use drainq_extract::{Field, FieldSet, StructuredResult};
use drainq_infra::jobs::{
    claim, ClaimError, Job, JobPayload, JobQuery, JobStatus, JobStore, JobStoreError, PostgresJobStore, RetryPolicy,
};

async fn store() -> Option<PostgresJobStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("failed to connect to DATABASE_URL");
    let store = PostgresJobStore::new(pool).with_batch_limit(10);
    store.ensure_schema().await.expect("failed to create schema");
    Some(store)
}

fn unique_owner() -> OwnerId {
    OwnerId::parse(&format!("pg-{}", uuid::Uuid::now_v7().simple())).unwrap()
}

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn job(owner: &OwnerId, secs: i64) -> Job {
    Job::new(
        owner.clone(),
        JobPayload::new("Ada Lovelace\nada@engines.example", FieldSet::new([Field::Name, Field::Email]).unwrap()),
        t(secs),
    )
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn stale_version_is_a_conflict() {
    let Some(store) = store().await else { return };
    let owner = unique_owner();
    let clock = ManualClock::at_secs(1_000);

    let queued = store.insert(job(&owner, 1)).await.unwrap();
    let claimed = claim(&store, &clock, queued.id, &owner).await.unwrap();
    assert_eq!(claimed.job.version, 2);

    // A second claimant holding the queued copy loses.
    let err = claim(&store, &clock, queued.id, &owner).await.unwrap_err();
    assert!(matches!(err, ClaimError::NotClaimable { .. }));

    let mut stale = queued.clone();
    stale.claim(t(1_001)).unwrap();
    let err = store.compare_and_set(&stale, ExpectedVersion::Exact(1)).await.unwrap_err();
    assert!(matches!(err, JobStoreError::Conflict { actual: 2, .. }));

    let stored = store.get(queued.id).await.unwrap().unwrap();
    assert_eq!(stored.claimed_at, Some(t(1_000)));
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn terminal_rows_are_locked() {
    let Some(store) = store().await else { return };
    let owner = unique_owner();
    let clock = ManualClock::at_secs(1_000);

    let queued = store.insert(job(&owner, 1)).await.unwrap();
    let claimed = claim(&store, &clock, queued.id, &owner).await.unwrap();
    let token = claimed.token();
    let mut done = claimed.into_job();
    done.complete(StructuredResult::complete(&done.payload.fields, Default::default()), false, t(1_010))
        .unwrap();
    let done = store.compare_and_set(&done, token).await.unwrap();
    assert_eq!(done.status, JobStatus::Done);

    let mut forged = done.clone();
    forged.status = JobStatus::Queued;
    forged.outcome = None;
    let err = store.compare_and_set(&forged, ExpectedVersion::Any).await.unwrap_err();
    assert_eq!(err, JobStoreError::TerminalLocked(done.id));

    let mut retry = done.clone();
    let err = retry.fail("late", &RetryPolicy::new(3), t(1_020)).unwrap_err();
    assert!(err.to_string().contains("already done"));
    assert_eq!(store.get(done.id).await.unwrap().unwrap(), done);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn query_is_fifo_and_updates_keep_the_payload() {
    let Some(store) = store().await else { return };
    let owner = unique_owner();

    let late = store.insert(job(&owner, 20)).await.unwrap();
    let early = store.insert(job(&owner, 10)).await.unwrap();

    let queued = store
        .query(&JobQuery::owner(owner.clone()).with_status(JobStatus::Queued))
        .await
        .unwrap();
    assert_eq!(queued.iter().map(|j| j.id).collect::<Vec<_>>(), vec![early.id, late.id]);

    let mut moved = early.clone();
    moved.claim(t(30)).unwrap();
    moved.enqueued_at = t(99);
    moved.payload.text = "rewritten".into();
    let updated = store.compare_and_set(&moved, ExpectedVersion::Exact(1)).await.unwrap();
    assert_eq!(updated.enqueued_at, t(10));
    assert_eq!(updated.payload, early.payload);
}
