//! The scheduler periodically drives dispatch, reconciliation, and retries.
//!
//! There is no push-based broker anywhere in the design: any number of
//! independent scheduler loops may run against the same database, each on
//! its own timer, optionally staggered so their ticks spread across the
//! tick interval. On every tick the scheduler independently:
//!
//! 1. sweeps jobs still `queued` into dispatch (recovery for anything the
//!    submission hook missed, e.g. after a crash between insert and
//!    dispatch);
//! 2. runs one reconciliation pass under a leased worker slot — when every
//!    slot is taken, the tick is simply dropped;
//! 3. on a slower cadence, re-dispatches failed jobs with retries
//!    remaining, and (only if configured) reaps jobs stuck in flight.
//!
//! No step depends on another and none is fatal: a failing step is logged
//! and the loop carries on.

use std::time::{Duration as StdDuration, Instant};

use jiff::{Span, ToSpan};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    dispatcher::{Dispatcher, Error as DispatcherError},
    queue::{self, Error as QueueError, Queue},
    slot::{Error as SlotError, SlotPool},
    tracker::Tracker,
    transport::Transport,
};

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned from dispatcher operations.
    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    /// Error returned from queue operations.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Error returned from slot pool operations.
    #[error(transparent)]
    Slot(#[from] SlotError),

    /// Error returned by the `jiff` crate.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
}

/// Periodic driver over a queue, dispatcher, tracker, and slot pool.
#[derive(Debug, Clone)]
pub struct Scheduler<T: Transport> {
    queue: Queue,
    dispatcher: Dispatcher<T>,
    tracker: Tracker<T>,
    slots: SlotPool,
    tick_interval: Span,
    retry_interval: Span,
    stagger: Option<Span>,
    reap_stale_after: Option<Span>,
    batch_size: i64,
    shutdown_token: CancellationToken,
}

impl<T: Transport> Scheduler<T> {
    /// Creates a scheduler with the default cadences: a tick every minute
    /// and a retry sweep every ten minutes.
    pub fn new(queue: Queue, dispatcher: Dispatcher<T>, tracker: Tracker<T>, slots: SlotPool) -> Self {
        Self {
            queue,
            dispatcher,
            tracker,
            slots,
            tick_interval: 1.minute(),
            retry_interval: 10.minutes(),
            stagger: None,
            reap_stale_after: None,
            batch_size: 100,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Sets the tick interval used by [`run`](Scheduler::run).
    pub fn with_tick_interval(mut self, tick_interval: Span) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Sets the cadence of the retry sweep.
    ///
    /// Failed jobs wait for this sweep, so the cadence is effectively the
    /// (flat) retry backoff interval.
    pub fn with_retry_interval(mut self, retry_interval: Span) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Delays the first tick by the given offset.
    ///
    /// Useful when running several scheduler loops against the same
    /// database: staggered sub-interval offsets spread their ticks evenly
    /// instead of landing at the same instant.
    pub fn with_stagger(mut self, stagger: Span) -> Self {
        self.stagger = Some(stagger);
        self
    }

    /// Enables the stale-job reaper: jobs stuck in `dispatching` or
    /// `in_flight` longer than `older_than` are moved back to `failed` on
    /// the retry cadence.
    ///
    /// Off by default; see [`queue::reap_stale`] for the trade-off.
    pub fn reap_stale_after(mut self, older_than: Span) -> Self {
        self.reap_stale_after = Some(older_than);
        self
    }

    /// Sets how many jobs each sweep may claim per tick.
    pub fn with_sweep_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Replaces the shutdown token, e.g. to share one token across several
    /// loops.
    pub fn with_shutdown_token(mut self, shutdown_token: CancellationToken) -> Self {
        self.shutdown_token = shutdown_token;
        self
    }

    /// A token that stops the running loop when cancelled.
    ///
    /// Hand this to your signal handler for graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs the scheduler on the configured tick interval until shut down.
    pub async fn run(&self) -> Result {
        self.run_every(self.tick_interval).await
    }

    /// Same as [`run`](Scheduler::run), but ticking at the given period.
    pub async fn run_every(&self, period: Span) -> Result {
        if let Some(stagger) = self.stagger {
            tokio::time::sleep(stagger.try_into()?).await;
        }

        let retry_every: StdDuration = self.retry_interval.try_into()?;
        let mut interval = tokio::time::interval(period.try_into()?);
        let mut last_retry_sweep = None;

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Scheduler received shutdown; stopping");
                    return Ok(());
                }

                _ = interval.tick() => {}
            }

            self.tick(&mut last_retry_sweep, retry_every).await;
        }
    }

    /// One tick: dispatch sweep, leased reconciliation, and — when due —
    /// the retry sweep. Step failures are logged, never propagated; one
    /// bad pass must not take the loop down.
    #[instrument(skip_all)]
    async fn tick(&self, last_retry_sweep: &mut Option<Instant>, retry_every: StdDuration) {
        if let Err(err) = self.dispatcher.dispatch_queued(self.batch_size).await {
            tracing::error!(err = %err, "Dispatch sweep failed");
        }

        match self
            .slots
            .with_leased_slot(|| self.tracker.reconcile_all())
            .await
        {
            Ok(Some(Ok(resolved))) => {
                if resolved > 0 {
                    tracing::debug!(resolved, "Reconciled in-flight handles");
                }
            }
            Ok(Some(Err(err))) => tracing::error!(err = %err, "Reconciliation pass failed"),
            Ok(None) => {
                tracing::debug!("All worker slots leased; dropping reconciliation tick");
            }
            Err(err) => tracing::error!(err = %err, "Worker slot lease failed"),
        }

        let retry_due = last_retry_sweep.map_or(true, |at: Instant| at.elapsed() >= retry_every);
        if retry_due {
            *last_retry_sweep = Some(Instant::now());

            if let Err(err) = self.dispatcher.retry_sweep(self.batch_size).await {
                tracing::error!(err = %err, "Retry sweep failed");
            }

            if let Some(older_than) = self.reap_stale_after {
                match queue::reap_stale(&self.queue.pool, older_than).await {
                    Ok(0) => {}
                    Ok(reaped) => tracing::warn!(reaped, "Reaped stale jobs back to failed"),
                    Err(err) => tracing::error!(err = %err, "Stale reap failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use serde_json::json;
    use sqlx::PgPool;

    use super::*;
    use crate::{
        job::{JobId, State, Submission},
        transport::{
            Disposition, Error as TransportError, HandleId, OutboundRequest,
            Result as TransportResult,
        },
    };

    /// Transport for which every request promptly succeeds with a 200.
    #[derive(Debug, Clone)]
    struct AlwaysOkTransport;

    impl Transport for AlwaysOkTransport {
        async fn send(&self, _request: OutboundRequest) -> TransportResult<HandleId> {
            Ok(HandleId::new())
        }

        async fn collect(&self, _handle: HandleId) -> TransportResult<Disposition> {
            Ok(Disposition::Delivered {
                status: 200,
                body: r#"{"ok":true}"#.to_string(),
            })
        }
    }

    /// Transport that can never issue a request, counting the attempts.
    #[derive(Debug, Clone, Default)]
    struct AlwaysDownTransport {
        attempts: Arc<AtomicUsize>,
    }

    impl Transport for AlwaysDownTransport {
        async fn send(&self, _request: OutboundRequest) -> TransportResult<HandleId> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Unavailable("no route to host".to_string()))
        }

        async fn collect(&self, _handle: HandleId) -> TransportResult<Disposition> {
            Ok(Disposition::Pending)
        }
    }

    fn scheduler_over<T: Transport + Clone>(pool: &PgPool, transport: T) -> Scheduler<T> {
        let queue = Queue::new(pool.clone());
        let dispatcher = Dispatcher::new(
            queue.clone(),
            transport.clone(),
            "http://localhost:9000/".parse().expect("URL should parse"),
        );
        let tracker = Tracker::new(queue.clone(), transport);
        let slots = SlotPool::new(pool.clone());
        Scheduler::new(queue, dispatcher, tracker, slots)
    }

    async fn wait_for<F>(pool: &PgPool, job_id: JobId, predicate: F) -> crate::job::Job
    where
        F: Fn(&crate::job::Job) -> bool,
    {
        let queue = Queue::new(pool.clone());
        for _ in 0..200 {
            let job = queue
                .job(pool, job_id)
                .await
                .expect("Lookup should succeed")
                .expect("Job should exist");
            if predicate(&job) {
                return job;
            }
            tokio::time::sleep(StdDuration::from_millis(25)).await;
        }
        panic!("job never reached the expected state");
    }

    #[sqlx::test]
    async fn ticks_drive_submitted_jobs_to_completion(pool: PgPool) -> sqlx::Result<(), Error> {
        SlotPool::provision(&pool, 2).await?;

        let queue = Queue::new(pool.clone());
        let job_id = queue
            .submit(&pool, Submission::post("/ingest").payload(json!({"x": 1})))
            .await?;

        let scheduler = scheduler_over(&pool, AlwaysOkTransport);
        let shutdown = scheduler.shutdown_token();
        let handle = tokio::spawn(async move {
            scheduler.run_every(50.milliseconds()).await
        });

        let job = wait_for(&pool, job_id, |job| job.state == State::Complete).await;
        assert_eq!(job.result_body.as_deref(), Some(r#"{"ok":true}"#));
        assert_eq!(job.retry_count, 0);

        shutdown.cancel();
        handle.await.expect("Scheduler should not panic")?;

        Ok(())
    }

    #[sqlx::test]
    async fn retries_stop_at_the_limit(pool: PgPool) -> sqlx::Result<(), Error> {
        SlotPool::provision(&pool, 2).await?;

        let queue = Queue::new(pool.clone());
        let job_id = queue
            .submit(&pool, Submission::get("/flaky").retry_limit(2))
            .await?;

        let transport = AlwaysDownTransport::default();
        let scheduler = scheduler_over(&pool, transport.clone())
            .with_retry_interval(100.milliseconds());
        let shutdown = scheduler.shutdown_token();
        let handle = tokio::spawn(async move {
            scheduler.run_every(50.milliseconds()).await
        });

        let job = wait_for(&pool, job_id, |job| {
            job.state == State::Failed && job.retry_count == 2
        })
        .await;
        assert!(job.is_terminal());

        // Give the loop room to (incorrectly) try again, then confirm the
        // attempt count froze at the limit.
        tokio::time::sleep(StdDuration::from_millis(400)).await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);

        let job = queue.job(&pool, job_id).await?.expect("Job should exist");
        assert_eq!(job.state, State::Failed);
        assert_eq!(job.retry_count, 2);

        shutdown.cancel();
        handle.await.expect("Scheduler should not panic")?;

        Ok(())
    }

    #[sqlx::test]
    async fn reaper_recovers_stale_jobs(pool: PgPool) -> sqlx::Result<(), Error> {
        SlotPool::provision(&pool, 2).await?;

        let queue = Queue::new(pool.clone());

        // An in-flight job whose handle was lost: no transport knows it,
        // so it pends forever.
        let job_id = queue.submit(&pool, Submission::get("/slow")).await?;
        queue.mark_dispatching(&pool, job_id).await?;
        queue.mark_in_flight(&pool, job_id).await?;
        sqlx::query("update courier.job set updated_at = now() - interval '2 hours' where id = $1")
            .bind(job_id)
            .execute(&pool)
            .await
            .map_err(QueueError::from)?;

        let scheduler = scheduler_over(&pool, AlwaysOkTransport)
            .with_retry_interval(50.milliseconds())
            .reap_stale_after(1.hour());
        let shutdown = scheduler.shutdown_token();
        let handle = tokio::spawn(async move {
            scheduler.run_every(50.milliseconds()).await
        });

        // Reaped to failed, then re-dispatched by the retry sweep and
        // completed by the (now succeeding) transport.
        wait_for(&pool, job_id, |job| job.state == State::Complete).await;

        shutdown.cancel();
        handle.await.expect("Scheduler should not panic")?;

        Ok(())
    }

    #[sqlx::test]
    async fn shutdown_stops_the_loop(pool: PgPool) -> sqlx::Result<(), Error> {
        SlotPool::provision(&pool, 1).await?;

        let scheduler = scheduler_over(&pool, AlwaysOkTransport);
        let shutdown = scheduler.shutdown_token();
        let handle = tokio::spawn(async move { scheduler.run().await });

        shutdown.cancel();

        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .expect("Loop should stop promptly")
            .expect("Scheduler should not panic")?;

        Ok(())
    }
}
