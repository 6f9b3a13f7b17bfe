//! The client is the user-facing handle over the whole pipeline.
//!
//! A [`Courier`] bundles the queue, dispatcher, tracker, and worker slot
//! pool behind two operations external callers actually use: submitting a
//! job and polling it by ID. Submission is event-driven — the dispatcher
//! fires synchronously, exactly once, as part of [`Courier::submit`] — and
//! everything else (reconciliation, retries, crash recovery) is driven by
//! the [`Scheduler`] the courier hands out.
//!
//! ```rust,no_run
//! # use tokio::runtime::Runtime;
//! # use sqlx::PgPool;
//! use courier::{Courier, HttpTransport, Submission, Url};
//! use serde_json::json;
//!
//! # fn main() {
//! # let rt = Runtime::new().unwrap();
//! # rt.block_on(async {
//! # let pool = PgPool::connect(&std::env::var("DATABASE_URL")?).await?;
//! let courier = Courier::builder()
//!     .pool(pool)
//!     .base_url(Url::parse("https://api.example.com")?)
//!     .transport(HttpTransport::new())
//!     .worker_slots(4)
//!     .build()
//!     .await?;
//!
//! // Submit a job; it is dispatched right away.
//! let job_id = courier
//!     .submit(Submission::post("/ingest").payload(json!({"x": 1})))
//!     .await?;
//!
//! // Poll for the terminal outcome.
//! let job = courier.job(job_id).await?;
//!
//! // Run the periodic driver (typically in its own task).
//! courier.scheduler().run().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! # }
//! ```

use std::marker::PhantomData;

use builder_states::{BaseUrlSet, Initial, PoolSet, TransportSet};
use jiff::{Span, ToSpan};
use reqwest::Url;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::{
    dispatcher::Dispatcher,
    job::{Job, JobId, Submission},
    queue::{Error as QueueError, Queue},
    retry::RetryPolicy,
    scheduler::Scheduler,
    slot::{Error as SlotError, SlotPool},
    tracker::Tracker,
    transport::Transport,
};

type Result<T = ()> = std::result::Result<T, Error>;

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
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

/// Durable HTTP dispatch client.
#[derive(Debug, Clone)]
pub struct Courier<T: Transport> {
    queue: Queue,
    dispatcher: Dispatcher<T>,
    tracker: Tracker<T>,
    slots: SlotPool,
    retry_policy: RetryPolicy,
    tick_interval: Span,
    retry_interval: Span,
    stagger: Option<Span>,
    reap_stale_after: Option<Span>,
    shutdown_token: CancellationToken,
}

impl<T: Transport + Clone> Courier<T> {
    /// Creates a builder for a new courier.
    pub fn builder() -> Builder<T, Initial> {
        Builder::default()
    }

    /// Submits a new job, returning its ID.
    ///
    /// The job is inserted durably and the dispatcher fires synchronously,
    /// exactly once, before this returns. A dispatch failure is not a
    /// submission failure: the job simply proceeds through the retry path
    /// (or the recovery sweep) and the error is observable on the job row.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    ///
    /// - The submission's retry limit is below one.
    /// - The database operation fails during the insertion.
    pub async fn submit(&self, submission: Submission) -> Result<JobId> {
        let job_id = self.queue.submit(&self.queue.pool, submission).await?;

        // The one-shot submission hand-off. Anything that goes wrong past
        // insertion is recoverable: the job is durable and the scheduler's
        // sweeps will pick it up.
        if let Err(err) = self.dispatcher.dispatch_submitted(job_id).await {
            tracing::error!(
                err = %err,
                job.id = %job_id,
                "Submission hook failed; job awaits the recovery sweep"
            );
        }

        Ok(job_id)
    }

    /// Retrieves a job by ID.
    ///
    /// Polling this is the completion-observation contract: a terminal job
    /// shows either `complete` with `result_body` populated, or `failed`
    /// with `retry_count == retry_limit` once retries are exhausted.
    pub async fn job(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.queue.job(&self.queue.pool, job_id).await?)
    }

    /// Constructs the periodic driver configured for this courier.
    ///
    /// Run as many as you like, across as many processes as you like; they
    /// coordinate through the database. All schedulers built from clones of
    /// one courier share its shutdown token.
    pub fn scheduler(&self) -> Scheduler<T> {
        let mut scheduler = Scheduler::new(
            self.queue.clone(),
            self.dispatcher.clone(),
            self.tracker.clone(),
            self.slots.clone(),
        )
        .with_tick_interval(self.tick_interval)
        .with_retry_interval(self.retry_interval)
        .with_sweep_batch_size(self.retry_policy.sweep_batch_size)
        .with_shutdown_token(self.shutdown_token.clone());

        if let Some(stagger) = self.stagger {
            scheduler = scheduler.with_stagger(stagger);
        }
        if let Some(older_than) = self.reap_stale_after {
            scheduler = scheduler.reap_stale_after(older_than);
        }

        scheduler
    }

    /// Signals every scheduler built from this courier to stop.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

mod builder_states {
    use reqwest::Url;
    use sqlx::PgPool;

    pub struct Initial;

    pub struct PoolSet {
        pub pool: PgPool,
    }

    pub struct BaseUrlSet {
        pub pool: PgPool,
        pub base_url: Url,
    }

    pub struct TransportSet<T> {
        pub pool: PgPool,
        pub base_url: Url,
        pub transport: T,
    }
}

/// Builds a [`Courier`].
///
/// The pool, base URL, and transport are required, in that order; the rest
/// is configuration with the defaults the crate documents.
#[derive(Debug)]
pub struct Builder<T, S = Initial> {
    state: S,
    worker_slots: Option<i32>,
    request_timeout: Span,
    retry_policy: RetryPolicy,
    tick_interval: Span,
    retry_interval: Span,
    stagger: Option<Span>,
    reap_stale_after: Option<Span>,
    _marker: PhantomData<T>,
}

impl<T, S> Builder<T, S> {
    /// Sets the worker slot pool size provisioned at build.
    ///
    /// Defaults to one slot per available CPU.
    pub fn worker_slots(mut self, worker_slots: i32) -> Self {
        self.worker_slots = Some(worker_slots);
        self
    }

    /// Sets the per-request timeout. Defaults to three seconds.
    pub fn request_timeout(mut self, request_timeout: Span) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Sets the retry policy. Defaults to a retry limit of ten and sweep
    /// batches of one hundred.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Sets the scheduler tick interval. Defaults to one minute.
    pub fn tick_interval(mut self, tick_interval: Span) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Sets the retry sweep cadence. Defaults to ten minutes.
    pub fn retry_interval(mut self, retry_interval: Span) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Staggers the first scheduler tick by the given offset.
    pub fn stagger(mut self, stagger: Span) -> Self {
        self.stagger = Some(stagger);
        self
    }

    /// Enables the stale-job reaper with the given threshold.
    pub fn reap_stale_after(mut self, older_than: Span) -> Self {
        self.reap_stale_after = Some(older_than);
        self
    }

    fn into_state<S2>(self, state: S2) -> Builder<T, S2> {
        Builder {
            state,
            worker_slots: self.worker_slots,
            request_timeout: self.request_timeout,
            retry_policy: self.retry_policy,
            tick_interval: self.tick_interval,
            retry_interval: self.retry_interval,
            stagger: self.stagger,
            reap_stale_after: self.reap_stale_after,
            _marker: PhantomData,
        }
    }
}

impl<T: Transport> Default for Builder<T, Initial> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Builder<T, Initial> {
    /// Create a new courier builder.
    pub fn new() -> Self {
        Self {
            state: Initial,
            worker_slots: None,
            request_timeout: 3.seconds(),
            retry_policy: RetryPolicy::default(),
            tick_interval: 1.minute(),
            retry_interval: 10.minutes(),
            stagger: None,
            reap_stale_after: None,
            _marker: PhantomData,
        }
    }

    /// Set the database connection pool.
    pub fn pool(self, pool: PgPool) -> Builder<T, PoolSet> {
        self.into_state(PoolSet { pool })
    }
}

impl<T: Transport> Builder<T, PoolSet> {
    /// Set the base destination that target paths are joined onto.
    pub fn base_url(self, base_url: Url) -> Builder<T, BaseUrlSet> {
        let Builder {
            state: PoolSet { pool },
            worker_slots,
            request_timeout,
            retry_policy,
            tick_interval,
            retry_interval,
            stagger,
            reap_stale_after,
            _marker,
        } = self;
        Builder {
            state: BaseUrlSet { pool, base_url },
            worker_slots,
            request_timeout,
            retry_policy,
            tick_interval,
            retry_interval,
            stagger,
            reap_stale_after,
            _marker,
        }
    }
}

impl<T: Transport> Builder<T, BaseUrlSet> {
    /// Set the request transport.
    pub fn transport(self, transport: T) -> Builder<T, TransportSet<T>> {
        let Builder {
            state: BaseUrlSet { pool, base_url },
            worker_slots,
            request_timeout,
            retry_policy,
            tick_interval,
            retry_interval,
            stagger,
            reap_stale_after,
            _marker,
        } = self;
        Builder {
            state: TransportSet {
                pool,
                base_url,
                transport,
            },
            worker_slots,
            request_timeout,
            retry_policy,
            tick_interval,
            retry_interval,
            stagger,
            reap_stale_after,
            _marker,
        }
    }
}

impl<T: Transport + Clone> Builder<T, TransportSet<T>> {
    /// Builds the courier, provisioning the worker slot pool.
    pub async fn build(self) -> Result<Courier<T>> {
        let size = self.worker_slots.unwrap_or_else(SlotPool::default_size);
        SlotPool::provision(&self.state.pool, size).await?;

        let TransportSet {
            pool,
            base_url,
            transport,
        } = self.state;

        let queue =
            Queue::new(pool.clone()).with_default_retry_limit(self.retry_policy.default_retry_limit);
        let dispatcher = Dispatcher::new(queue.clone(), transport.clone(), base_url)
            .with_request_timeout(self.request_timeout.try_into()?);
        let tracker = Tracker::new(queue.clone(), transport);
        let slots = SlotPool::new(pool);

        Ok(Courier {
            queue,
            dispatcher,
            tracker,
            slots,
            retry_policy: self.retry_policy,
            tick_interval: self.tick_interval,
            retry_interval: self.retry_interval,
            stagger: self.stagger,
            reap_stale_after: self.reap_stale_after,
            shutdown_token: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use serde_json::json;
    use sqlx::PgPool;

    use super::*;
    use crate::{
        job::State,
        transport::{
            Disposition, Error as TransportError, HandleId, OutboundRequest,
            Result as TransportResult,
        },
    };

    #[derive(Debug, Clone)]
    struct AlwaysOkTransport;

    impl Transport for AlwaysOkTransport {
        async fn send(&self, _request: OutboundRequest) -> TransportResult<HandleId> {
            Ok(HandleId::new())
        }

        async fn collect(&self, _handle: HandleId) -> TransportResult<Disposition> {
            Ok(Disposition::Delivered {
                status: 200,
                body: "accepted".to_string(),
            })
        }
    }

    #[derive(Debug, Clone)]
    struct AlwaysDownTransport;

    impl Transport for AlwaysDownTransport {
        async fn send(&self, _request: OutboundRequest) -> TransportResult<HandleId> {
            Err(TransportError::Unavailable("no route to host".to_string()))
        }

        async fn collect(&self, _handle: HandleId) -> TransportResult<Disposition> {
            Ok(Disposition::Pending)
        }
    }

    async fn build_courier<T: Transport + Clone>(
        pool: &PgPool,
        transport: T,
    ) -> Result<Courier<T>> {
        Courier::builder()
            .pool(pool.clone())
            .base_url("http://localhost:9000/".parse().expect("URL should parse"))
            .transport(transport)
            .worker_slots(2)
            .tick_interval(50.milliseconds())
            .retry_interval(100.milliseconds())
            .build()
            .await
    }

    #[sqlx::test]
    async fn submit_fires_the_dispatcher_once(pool: PgPool) -> sqlx::Result<(), Error> {
        let courier = build_courier(&pool, AlwaysOkTransport).await?;

        let job_id = courier
            .submit(Submission::post("/ingest").payload(json!({"x": 1})))
            .await?;

        // No scheduler running: the submission hook alone got the job in
        // flight.
        let job = courier.job(job_id).await?.expect("Job should exist");
        assert_eq!(job.state, State::InFlight);

        Ok(())
    }

    #[sqlx::test]
    async fn submitted_jobs_complete_end_to_end(pool: PgPool) -> sqlx::Result<(), Error> {
        let courier = build_courier(&pool, AlwaysOkTransport).await?;

        let job_id = courier
            .submit(Submission::post("/ingest").payload(json!({"x": 1})))
            .await?;

        let scheduler = courier.scheduler();
        let handle = tokio::spawn(async move { scheduler.run().await });

        let mut completed = None;
        for _ in 0..200 {
            let job = courier.job(job_id).await?.expect("Job should exist");
            if job.state == State::Complete {
                completed = Some(job);
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(25)).await;
        }

        let job = completed.expect("Job should have completed");
        assert_eq!(job.result_body.as_deref(), Some("accepted"));

        courier.shutdown();
        handle
            .await
            .expect("Scheduler should not panic")
            .expect("Scheduler should stop cleanly");

        Ok(())
    }

    #[sqlx::test]
    async fn hook_failures_route_to_the_retry_path(pool: PgPool) -> sqlx::Result<(), Error> {
        let courier = build_courier(&pool, AlwaysDownTransport).await?;

        // Submission itself succeeds even though dispatch cannot.
        let job_id = courier.submit(Submission::get("/status")).await?;

        let job = courier.job(job_id).await?.expect("Job should exist");
        assert_eq!(job.state, State::Failed);
        assert_eq!(job.retry_count, 1);
        assert!(job.last_error.is_some());

        Ok(())
    }

    #[sqlx::test]
    async fn submit_surfaces_validation_errors(pool: PgPool) -> sqlx::Result<(), Error> {
        let courier = build_courier(&pool, AlwaysOkTransport).await?;

        let result = courier
            .submit(Submission::get("/status").retry_limit(0))
            .await;
        assert!(matches!(
            result,
            Err(Error::Queue(QueueError::InvalidRetryLimit(0)))
        ));

        Ok(())
    }

    #[sqlx::test]
    async fn build_provisions_the_slot_pool(pool: PgPool) -> sqlx::Result<(), Error> {
        let _courier = build_courier(&pool, AlwaysOkTransport).await?;

        let slots = sqlx::query_scalar::<_, i64>("select count(*) from courier.worker_slot")
            .fetch_one(&pool)
            .await
            .map_err(QueueError::from)?;
        assert_eq!(slots, 2);

        Ok(())
    }
}
