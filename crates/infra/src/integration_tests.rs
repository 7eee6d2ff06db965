//! Integration tests for the request → queue → worker → cache → ledger pipeline.
//!
//! Verifies:
//! - A completed job's output lands in the cache and its usage in the ledger
//! - Event-driven invalidation clears what the worker cached
//! - Recurring maintenance is enqueued once per kind and runs through the pool
//! - A stuck job is recovered and its stale worker cannot settle it

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use serde_json::json;

    use bulwark_core::{CallerId, ManualClock, UpstreamError};

    use crate::cache::{InvalidationStrategy, TierFlags};
    use crate::config::BulwarkConfig;
    use crate::context::AppContext;
    use crate::jobs::{EnqueueOptions, FnHandler, Job, JobKind, JobOutput, JobStatus, QueueError};

    fn setup() -> (AppContext, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
        ));
        let ctx = AppContext::in_memory_with_clock(BulwarkConfig::default(), clock.clone());
        ctx.register_handler(
            JobKind::Scrape,
            Arc::new(
                FnHandler::new(|payload: serde_json::Value, _job: Job| async move {
                    let Some(subject) = payload["subject"].as_str().map(str::to_string) else {
                        return Err(UpstreamError::parsing("missing subject"));
                    };
                    Ok(JobOutput::new(json!({ "subject": subject, "followers": 42 })).cached(
                        format!("profile:{subject}"),
                        None,
                        vec![format!("user:{subject}")],
                    ))
                })
                .with_dependency("profile-source"),
            ),
        );
        (ctx, clock)
    }

    #[tokio::test]
    async fn completed_job_feeds_cache_and_ledger() {
        let (ctx, _clock) = setup();
        let caller = CallerId::new("acme");
        let executor = ctx.executor();

        let admission = ctx.ledger.check_admission(&caller).await;
        assert!(admission.allowed);
        assert!(admission.slot_reserved);

        let job = ctx
            .queue
            .enqueue(
                JobKind::Scrape,
                json!({ "subject": "alice" }),
                EnqueueOptions::default().caller(caller.clone()),
            )
            .await
            .unwrap();
        assert!(executor.process_next("worker-1").await.unwrap());
        ctx.ledger.complete_request(&caller).await.unwrap();

        let done = ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(
            ctx.cache.get("profile:alice", TierFlags::ALL).await,
            Some(json!({ "subject": "alice", "followers": 42 }))
        );

        let record = ctx.ledger.snapshot(&caller).await.unwrap().unwrap();
        assert_eq!(record.daily.used, 1);
        assert_eq!(record.monthly.used, 1);
        assert_eq!(record.concurrent.current, 0);
        assert_eq!(record.recent.back().unwrap().sample.endpoint, "job:scrape");

        ctx.cache
            .register_strategy(InvalidationStrategy::tags("profile", "user.updated", ["user:{user_id}"]).cascading());
        let report = ctx
            .cache
            .smart_invalidate("user.updated", &json!({ "user_id": "alice" }))
            .await;
        assert_eq!(report.invalidated, 1);
        assert_eq!(ctx.cache.get("profile:alice", TierFlags::ALL).await, None);
    }

    #[tokio::test]
    async fn handler_parse_error_fails_without_cache_write() {
        let (ctx, _clock) = setup();
        let job = ctx
            .queue
            .enqueue(JobKind::Scrape, json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        ctx.executor().process_next("worker-1").await.unwrap();

        let failed = ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(ctx.cache.stats().sets, 0);
    }

    #[tokio::test]
    async fn recurring_maintenance_runs_once_per_kind() {
        let (ctx, clock) = setup();
        let scheduler = ctx.scheduler();
        let executor = ctx.executor();

        assert!(scheduler.run_due().await.unwrap().is_empty());

        clock.advance(chrono::Duration::hours(1));
        let enqueued = scheduler.run_due().await.unwrap();
        assert_eq!(enqueued.len(), 4);

        // Nothing has run yet, so every kind is still active.
        clock.advance(chrono::Duration::hours(1));
        assert!(scheduler.run_due().await.unwrap().is_empty());

        while executor.process_next("worker-1").await.unwrap() {}
        let stats = ctx.queue.stats().await.unwrap();
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn stuck_job_is_recovered_and_stale_worker_loses_claim() {
        let (ctx, clock) = setup();
        ctx.queue
            .enqueue(JobKind::Scrape, json!({ "subject": "bob" }), EnqueueOptions::default())
            .await
            .unwrap();

        let claimed = ctx.queue.claim_next("crashed", None).await.unwrap().unwrap();
        clock.advance(chrono::Duration::minutes(11));
        assert_eq!(ctx.queue.recover_stuck().await.unwrap(), 1);

        let recovered = ctx.queue.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Retrying);

        clock.advance(chrono::Duration::seconds(5));
        assert!(ctx.executor().process_next("worker-2").await.unwrap());
        let done = ctx.queue.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempts, 2);

        let err = ctx.queue.complete(&claimed, json!("late")).await.unwrap_err();
        assert!(matches!(err, QueueError::ClaimLost(id) if id == claimed.id));
        assert!(ctx.cache.get("profile:bob", TierFlags::LOCAL_ONLY).await.is_some());

        // Cancellation is only possible before a claim.
        assert!(ctx.queue.cancel(claimed.id).await.is_err());
    }
}
