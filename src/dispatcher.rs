//! The dispatcher turns claimed jobs into outbound requests.
//!
//! Exactly one request is issued per dispatch: the job's method, the base
//! destination joined with its target path, and its payload are assembled
//! into an [`OutboundRequest`](crate::OutboundRequest) which the transport
//! fires with a bounded per-request timeout. On a successful send the
//! returned handle is recorded and the job marked `in_flight` in one
//! transaction; when the request cannot even be issued the job is routed
//! straight into the retry path rather than wedging.
//!
//! Request targets are built with [`reqwest::Url::join`] — parameterized
//! construction, never string concatenation. Payloads stay opaque: a POST
//! sends the payload as its JSON body, while GET and DELETE turn top-level
//! object entries into query parameters (string values verbatim, anything
//! else JSON-encoded).

use std::time::Duration;

use reqwest::Url;
use serde_json::Value;
use tracing::instrument;

use crate::{
    job::{Job, JobId, Method},
    queue::{Error as QueueError, Queue},
    tracker,
    transport::{Error as TransportError, HandleId, OutboundRequest, Transport},
};

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// The default bound on how long a single outbound request may take.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Dispatcher errors.
///
/// Transport failures are deliberately absent: they are recorded on the job
/// and consumed by the retry path, never surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned from queue operations.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Converts jobs into outbound requests, one request per dispatch.
#[derive(Debug, Clone)]
pub struct Dispatcher<T: Transport> {
    queue: Queue,
    transport: T,
    base_url: Url,
    request_timeout: Duration,
}

impl<T: Transport> Dispatcher<T> {
    /// Creates a dispatcher sending to the given base destination.
    pub fn new(queue: Queue, transport: T, base_url: Url) -> Self {
        Self {
            queue,
            transport,
            base_url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Overrides the per-request timeout.
    ///
    /// Default value is three seconds. This bounds the only wait a dispatch
    /// may incur; responses are collected asynchronously by the tracker.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Dispatches a single claimed job.
    ///
    /// The job is expected to be in the `dispatching` state, i.e. returned
    /// by one of the claim methods. On send success the job becomes
    /// `in_flight` with its handle recorded atomically; on send failure it
    /// becomes `failed` and proceeds through the normal retry path. Either
    /// way the send outcome is not an error to the caller.
    #[instrument(skip(self, job), fields(job.id = %job.id), err)]
    pub async fn dispatch(&self, job: &Job) -> Result {
        match self.try_send(job).await {
            Ok(handle) => {
                let mut tx = self.queue.pool.begin().await?;
                self.queue.mark_in_flight(&mut *tx, job.id).await?;
                tracker::record_handle(&mut *tx, handle, job.id).await?;
                tx.commit().await?;

                Ok(())
            }

            Err(err) => {
                tracing::warn!(err = %err, "Dispatch failed; job takes the retry path");
                self.queue
                    .mark_failed(&self.queue.pool, job.id, &err.to_string())
                    .await?;

                Ok(())
            }
        }
    }

    /// Claims queued jobs and dispatches each, returning how many were
    /// dispatched.
    ///
    /// This is the recovery sweep: it covers jobs whose submission hook
    /// never ran, e.g. rows inserted directly or left behind by a crash
    /// between insert and dispatch. One job's failure never aborts the
    /// rest of the sweep.
    #[instrument(skip(self), err)]
    pub async fn dispatch_queued(&self, limit: i64) -> Result<u64> {
        let jobs = self.queue.claim_queued(&self.queue.pool, limit).await?;
        Ok(self.dispatch_each(jobs).await)
    }

    /// Claims failed jobs with retries remaining and re-dispatches each,
    /// returning how many were dispatched.
    ///
    /// Jobs that have exhausted their retry limit are never claimed and
    /// remain permanently `failed`; callers observe that terminal outcome
    /// via [`Queue::job`].
    #[instrument(skip(self), err)]
    pub async fn retry_sweep(&self, limit: i64) -> Result<u64> {
        let jobs = self.queue.claim_retryable(&self.queue.pool, limit).await?;
        Ok(self.dispatch_each(jobs).await)
    }

    async fn dispatch_each(&self, jobs: Vec<Job>) -> u64 {
        let mut dispatched = 0;
        for job in &jobs {
            match self.dispatch(job).await {
                Ok(()) => dispatched += 1,
                Err(err) => {
                    tracing::error!(err = %err, job.id = %job.id, "Failed to dispatch job");
                }
            }
        }
        dispatched
    }

    /// Claims and dispatches one freshly submitted job.
    ///
    /// This is the submission hook's entry point. Losing the claim is fine:
    /// it means a concurrent recovery sweep got there first and the job is
    /// already being dispatched.
    pub(crate) async fn dispatch_submitted(&self, job_id: JobId) -> Result {
        match self.queue.mark_dispatching(&self.queue.pool, job_id).await {
            Ok(()) => {}
            Err(QueueError::InvalidState(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let Some(job) = self.queue.job(&self.queue.pool, job_id).await? else {
            return Ok(());
        };

        self.dispatch(&job).await
    }

    async fn try_send(&self, job: &Job) -> std::result::Result<HandleId, TransportError> {
        let request = self.outbound_request(job)?;
        self.transport.send(request).await
    }

    fn outbound_request(&self, job: &Job) -> std::result::Result<OutboundRequest, TransportError> {
        let mut url = self
            .base_url
            .join(&job.target_path)
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;

        let body = match job.method {
            Method::Post => Some(job.payload.clone()),
            Method::Get | Method::Delete => {
                if let Some(entries) = job.payload.as_object() {
                    let mut pairs = url.query_pairs_mut();
                    for (key, value) in entries {
                        match value {
                            Value::String(s) => pairs.append_pair(key, s),
                            other => pairs.append_pair(key, &other.to_string()),
                        };
                    }
                }
                None
            }
        };

        Ok(OutboundRequest {
            method: job.method,
            url,
            headers: Vec::new(),
            body,
            timeout: self.request_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use sqlx::PgPool;

    use super::*;
    use crate::{
        job::{State, Submission},
        transport::{Disposition, Result as TransportResult},
    };

    /// Transport that accepts everything, capturing each sent request.
    #[derive(Debug, Clone, Default)]
    struct RecordingTransport {
        requests: Arc<Mutex<Vec<OutboundRequest>>>,
    }

    impl RecordingTransport {
        fn requests(&self) -> Vec<OutboundRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Transport for RecordingTransport {
        async fn send(&self, request: OutboundRequest) -> TransportResult<HandleId> {
            self.requests.lock().unwrap().push(request);
            Ok(HandleId::new())
        }

        async fn collect(&self, _handle: HandleId) -> TransportResult<Disposition> {
            Ok(Disposition::Pending)
        }
    }

    /// Transport that cannot issue requests at all.
    #[derive(Debug, Clone)]
    struct DownTransport;

    impl Transport for DownTransport {
        async fn send(&self, _request: OutboundRequest) -> TransportResult<HandleId> {
            Err(TransportError::Unavailable("connect refused".to_string()))
        }

        async fn collect(&self, _handle: HandleId) -> TransportResult<Disposition> {
            Ok(Disposition::Pending)
        }
    }

    fn base_url() -> Url {
        "http://localhost:9000/".parse().expect("URL should parse")
    }

    async fn live_handle_count(pool: &PgPool) -> sqlx::Result<i64> {
        sqlx::query_scalar("select count(*) from courier.in_flight_handle")
            .fetch_one(pool)
            .await
    }

    #[sqlx::test]
    async fn dispatch_records_handle_and_marks_in_flight(
        pool: PgPool,
    ) -> sqlx::Result<(), Error> {
        let queue = Queue::new(pool.clone());
        let transport = RecordingTransport::default();
        let dispatcher = Dispatcher::new(queue.clone(), transport.clone(), base_url());

        let job_id = queue
            .submit(&pool, Submission::post("/ingest").payload(json!({"x": 1})))
            .await?;
        queue.mark_dispatching(&pool, job_id).await?;
        let job = queue.job(&pool, job_id).await?.expect("Job should exist");

        dispatcher.dispatch(&job).await?;

        let job = queue.job(&pool, job_id).await?.expect("Job should exist");
        assert_eq!(job.state, State::InFlight);
        assert_eq!(live_handle_count(&pool).await?, 1);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.as_str(), "http://localhost:9000/ingest");
        assert_eq!(requests[0].method, crate::Method::Post);
        assert_eq!(requests[0].body, Some(json!({"x": 1})));
        assert_eq!(requests[0].timeout, DEFAULT_REQUEST_TIMEOUT);

        Ok(())
    }

    #[sqlx::test]
    async fn get_payloads_become_query_parameters(pool: PgPool) -> sqlx::Result<(), Error> {
        let queue = Queue::new(pool.clone());
        let transport = RecordingTransport::default();
        let dispatcher = Dispatcher::new(queue.clone(), transport.clone(), base_url());

        let job_id = queue
            .submit(
                &pool,
                Submission::get("/search").payload(json!({"q": "rust", "limit": 5})),
            )
            .await?;
        queue.mark_dispatching(&pool, job_id).await?;
        let job = queue.job(&pool, job_id).await?.expect("Job should exist");

        dispatcher.dispatch(&job).await?;

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].body.is_none());

        let pairs: Vec<(String, String)> = requests[0]
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("q".to_string(), "rust".to_string())));
        assert!(pairs.contains(&("limit".to_string(), "5".to_string())));

        Ok(())
    }

    #[sqlx::test]
    async fn send_failures_take_the_retry_path(pool: PgPool) -> sqlx::Result<(), Error> {
        let queue = Queue::new(pool.clone());
        let dispatcher = Dispatcher::new(queue.clone(), DownTransport, base_url());

        let job_id = queue.submit(&pool, Submission::get("/status")).await?;
        queue.mark_dispatching(&pool, job_id).await?;
        let job = queue.job(&pool, job_id).await?.expect("Job should exist");

        // Not an error to the caller.
        dispatcher.dispatch(&job).await?;

        let job = queue.job(&pool, job_id).await?.expect("Job should exist");
        assert_eq!(job.state, State::Failed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(
            job.last_error.as_deref(),
            Some("Transport unavailable: connect refused")
        );
        assert_eq!(live_handle_count(&pool).await?, 0);

        Ok(())
    }

    #[sqlx::test]
    async fn dispatch_queued_sweeps_unclaimed_jobs(pool: PgPool) -> sqlx::Result<(), Error> {
        let queue = Queue::new(pool.clone());
        let transport = RecordingTransport::default();
        let dispatcher = Dispatcher::new(queue.clone(), transport.clone(), base_url());

        // Submitted without the hook, as if a crash interrupted dispatch.
        let first = queue.submit(&pool, Submission::get("/a")).await?;
        let second = queue.submit(&pool, Submission::get("/b")).await?;

        assert_eq!(dispatcher.dispatch_queued(10).await?, 2);

        for job_id in [first, second] {
            let job = queue.job(&pool, job_id).await?.expect("Job should exist");
            assert_eq!(job.state, State::InFlight);
        }
        assert_eq!(live_handle_count(&pool).await?, 2);

        // Nothing left to sweep.
        assert_eq!(dispatcher.dispatch_queued(10).await?, 0);

        Ok(())
    }

    #[sqlx::test]
    async fn retry_sweep_redispatches_failed_jobs(pool: PgPool) -> sqlx::Result<(), Error> {
        let queue = Queue::new(pool.clone());
        let transport = RecordingTransport::default();
        let dispatcher = Dispatcher::new(queue.clone(), transport.clone(), base_url());

        let job_id = queue
            .submit(&pool, Submission::get("/flaky").retry_limit(3))
            .await?;
        queue.mark_dispatching(&pool, job_id).await?;
        queue.mark_failed(&pool, job_id, "boom").await?;

        assert_eq!(dispatcher.retry_sweep(10).await?, 1);

        let job = queue.job(&pool, job_id).await?.expect("Job should exist");
        assert_eq!(job.state, State::InFlight);
        assert_eq!(job.retry_count, 1);
        assert_eq!(live_handle_count(&pool).await?, 1);

        Ok(())
    }

    #[sqlx::test]
    async fn dispatch_submitted_tolerates_losing_the_claim(
        pool: PgPool,
    ) -> sqlx::Result<(), Error> {
        let queue = Queue::new(pool.clone());
        let transport = RecordingTransport::default();
        let dispatcher = Dispatcher::new(queue.clone(), transport.clone(), base_url());

        let job_id = queue.submit(&pool, Submission::get("/status")).await?;

        // A concurrent sweep wins the claim first.
        queue.mark_dispatching(&pool, job_id).await?;

        // The hook must treat that as already handled.
        dispatcher.dispatch_submitted(job_id).await?;
        assert!(transport.requests().is_empty());

        Ok(())
    }
}
