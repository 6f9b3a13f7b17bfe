//! Queues provide durable, consistent bookkeeping of job state.
//!
//! Jobs are inserted with the [`Queue::submit`] method and observed with
//! [`Queue::job`]. Everything in between — claiming work, advancing the
//! state machine, retry bookkeeping — happens through the methods here,
//! which are the only way job rows are mutated.
//!
//! # Claiming work without blocking
//!
//! Multiple independent processes may sweep the same queue concurrently.
//! The claim methods ([`claim_queued`](Queue::claim_queued) and
//! [`claim_retryable`](Queue::claim_retryable)) therefore use
//! `FOR UPDATE SKIP LOCKED` selection combined with an immediate state
//! transition, so concurrent sweepers partition the eligible rows rather
//! than blocking on or double-claiming them. A claimed job is already in
//! the `dispatching` state by the time it is returned.
//!
//! # Transaction scope
//!
//! As with most methods on [`Queue`], mutations accept an executor. This
//! lets callers group several mutations into one atomic step, e.g. marking
//! a job in-flight and recording its handle in the same transaction.
//!
//! # Deleting expired jobs
//!
//! Terminal jobs (`complete`, or `failed` with retries exhausted) are kept
//! for later inspection, but only for a fixed time-to-live. The deletion
//! routine must be explicitly driven; either [`run_deletion`] or
//! [`run_deletion_every`] should be spawned alongside the scheduler.
//!
//! **Note**: Jobs will not be deleted from the queue if this routine is not
//! running!

use jiff::{Span, ToSpan};
use sqlx::{PgExecutor, PgPool};
use tracing::instrument;

use crate::{
    job::{Job, JobId, State, Submission},
    retry::RetryPolicy,
};

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// How long terminal jobs are retained before [`delete_expired`] removes
/// them.
const JOB_TTL_DAYS: i32 = 14;

const JOB_COLUMNS: &str = "id, method, target_path, payload, state, retry_count, retry_limit, \
                           result_body, last_error, created_at, updated_at, completed_at";

// Qualified for statements where the job table is joined against a CTE.
const JOB_COLUMNS_QUALIFIED: &str =
    "j.id, j.method, j.target_path, j.payload, j.state, j.retry_count, j.retry_limit, \
     j.result_body, j.last_error, j.created_at, j.updated_at, j.completed_at";

/// Queue errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `jiff` crate.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),

    /// Indicates a submission carried a retry limit below one.
    ///
    /// A job must be allowed at least its initial dispatch attempt.
    #[error("Retry limit must be at least 1, got {0}.")]
    InvalidRetryLimit(i32),

    /// Indicates that the job doesn't exist or isn't in a state that
    /// permits the requested transition.
    #[error("Job with ID {0} not found in an eligible state.")]
    InvalidState(JobId),
}

/// Durable job store.
///
/// Cheap to clone; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct Queue {
    pub(crate) pool: PgPool,
    default_retry_limit: i32,
}

impl Queue {
    /// Creates a queue over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_retry_limit: RetryPolicy::default().default_retry_limit,
        }
    }

    /// Overrides the retry limit applied to submissions that don't carry
    /// one.
    pub fn with_default_retry_limit(mut self, default_retry_limit: i32) -> Self {
        self.default_retry_limit = default_retry_limit;
        self
    }

    /// Inserts a new job in the `queued` state, returning its ID.
    ///
    /// The request method is validated by the [`Method`](crate::Method)
    /// type itself; the payload and target path are stored opaquely.
    /// Submissions are never deduplicated — submitting the same payload
    /// twice yields two distinct jobs.
    ///
    /// Note that insertion alone does not dispatch the job: the submission
    /// hook on [`Courier::submit`](crate::Courier::submit) fires the
    /// dispatcher once per submission, and jobs inserted through other
    /// paths are picked up by the scheduler's recovery sweep.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    ///
    /// - The submission's retry limit is below one.
    /// - The database operation fails during the insertion.
    #[instrument(
        name = "submit",
        skip(self, executor, submission),
        fields(job.id = tracing::field::Empty),
        err
    )]
    pub async fn submit<'a, E>(&self, executor: E, submission: Submission) -> Result<JobId>
    where
        E: PgExecutor<'a>,
    {
        let retry_limit = submission.retry_limit.unwrap_or(self.default_retry_limit);
        if retry_limit < 1 {
            return Err(Error::InvalidRetryLimit(retry_limit));
        }

        let id = JobId::new();
        tracing::Span::current().record("job.id", id.to_string());

        sqlx::query(
            r#"
            insert into courier.job (id, method, target_path, payload, retry_limit)
            values ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(submission.method)
        .bind(&submission.target_path)
        .bind(&submission.payload)
        .bind(retry_limit)
        .execute(executor)
        .await?;

        Ok(id)
    }

    /// Retrieves a job by ID.
    ///
    /// This is the completion-observation surface: callers poll the
    /// returned [`Job`] for its state, `result_body`, and `retry_count`.
    pub async fn job<'a, E>(&self, executor: E, job_id: JobId) -> Result<Option<Job>>
    where
        E: PgExecutor<'a>,
    {
        let job = sqlx::query_as::<_, Job>(&format!(
            "select {JOB_COLUMNS} from courier.job where id = $1"
        ))
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

        Ok(job)
    }

    /// Transitions a job from `queued` to `dispatching`.
    ///
    /// The transition is guarded: a job in any other state is left
    /// untouched and [`Error::InvalidState`] is returned. This is what
    /// makes the submission hook and the recovery sweep race-safe — only
    /// one of them can win the claim.
    pub async fn mark_dispatching<'a, E>(&self, executor: E, job_id: JobId) -> Result
    where
        E: PgExecutor<'a>,
    {
        self.transition(executor, job_id, State::Queued, State::Dispatching)
            .await
    }

    /// Transitions a job from `dispatching` to `in_flight`.
    pub async fn mark_in_flight<'a, E>(&self, executor: E, job_id: JobId) -> Result
    where
        E: PgExecutor<'a>,
    {
        self.transition(executor, job_id, State::Dispatching, State::InFlight)
            .await
    }

    async fn transition<'a, E>(&self, executor: E, job_id: JobId, from: State, to: State) -> Result
    where
        E: PgExecutor<'a>,
    {
        let result = sqlx::query(
            r#"
            update courier.job
            set state = $2,
                updated_at = now()
            where id = $1
              and state = $3
            "#,
        )
        .bind(job_id)
        .bind(to)
        .bind(from)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidState(job_id));
        }

        Ok(())
    }

    /// Transitions a job from `in_flight` to `complete`, recording the
    /// response body. Terminal.
    #[instrument(skip(self, executor, result_body), fields(job.id = %job_id), err)]
    pub async fn mark_complete<'a, E>(
        &self,
        executor: E,
        job_id: JobId,
        result_body: &str,
    ) -> Result
    where
        E: PgExecutor<'a>,
    {
        let result = sqlx::query(
            r#"
            update courier.job
            set state = $2,
                result_body = $3,
                updated_at = now(),
                completed_at = now()
            where id = $1
              and state = $4
            "#,
        )
        .bind(job_id)
        .bind(State::Complete)
        .bind(result_body)
        .bind(State::InFlight)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidState(job_id));
        }

        Ok(())
    }

    /// Transitions a job to `failed`, consuming one retry attempt and
    /// recording the failure detail.
    ///
    /// Accepted from both `in_flight` (the collected response indicated
    /// failure) and `dispatching` (the request could not even be issued),
    /// so dispatch-call failures proceed through the normal retry path
    /// instead of wedging.
    #[instrument(skip(self, executor, error), fields(job.id = %job_id), err)]
    pub async fn mark_failed<'a, E>(&self, executor: E, job_id: JobId, error: &str) -> Result
    where
        E: PgExecutor<'a>,
    {
        let result = sqlx::query(
            r#"
            update courier.job
            set state = $2,
                retry_count = retry_count + 1,
                last_error = $3,
                updated_at = now()
            where id = $1
              and state in ($4, $5)
            "#,
        )
        .bind(job_id)
        .bind(State::Failed)
        .bind(error)
        .bind(State::Dispatching)
        .bind(State::InFlight)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidState(job_id));
        }

        Ok(())
    }

    /// Claims up to `limit` queued jobs for dispatch, oldest first.
    ///
    /// Selection uses `FOR UPDATE SKIP LOCKED` and transitions the claimed
    /// rows to `dispatching` in the same statement, so concurrent callers
    /// never claim the same job twice. This is the recovery sweep's entry
    /// point: it picks up anything the submission hook missed, e.g. after
    /// a crash between insert and dispatch.
    #[instrument(skip(self, executor), err)]
    pub async fn claim_queued<'a, E>(&self, executor: E, limit: i64) -> Result<Vec<Job>>
    where
        E: PgExecutor<'a>,
    {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            with claimable as (
                select id
                from courier.job
                where state = $1
                order by created_at, id
                limit $2
                for update skip locked
            )
            update courier.job j
            set state = $3,
                updated_at = now()
            from claimable
            where j.id = claimable.id
            returning {JOB_COLUMNS_QUALIFIED}
            "#
        ))
        .bind(State::Queued)
        .bind(limit)
        .bind(State::Dispatching)
        .fetch_all(executor)
        .await?;

        Ok(jobs)
    }

    /// Claims up to `limit` failed jobs with retries remaining, oldest
    /// first.
    ///
    /// Same skip-locked claim discipline as
    /// [`claim_queued`](Queue::claim_queued). Jobs whose `retry_count` has
    /// reached their `retry_limit` are never returned and remain permanently
    /// `failed`.
    #[instrument(skip(self, executor), err)]
    pub async fn claim_retryable<'a, E>(&self, executor: E, limit: i64) -> Result<Vec<Job>>
    where
        E: PgExecutor<'a>,
    {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            with claimable as (
                select id
                from courier.job
                where state = $1
                  and retry_count < retry_limit
                order by created_at, id
                limit $2
                for update skip locked
            )
            update courier.job j
            set state = $3,
                updated_at = now()
            from claimable
            where j.id = claimable.id
            returning {JOB_COLUMNS_QUALIFIED}
            "#
        ))
        .bind(State::Failed)
        .bind(limit)
        .bind(State::Dispatching)
        .fetch_all(executor)
        .await?;

        Ok(jobs)
    }
}

/// Moves jobs stuck in `dispatching` or `in_flight` longer than
/// `older_than` back to `failed`, consuming one retry attempt and removing
/// any dangling handle.
///
/// This is the explicit recovery policy for handles that were lost — a
/// crash between send and record, or a transport restart that forgot its
/// outstanding requests. It is deliberately opt-in: without it, a job whose
/// response never arrives remains visibly `in_flight`, which is a distinct
/// failure mode from `failed`. Enable it via
/// [`reap_stale_after`](crate::scheduler::Scheduler::reap_stale_after).
///
/// Returns the number of jobs reaped.
#[instrument(skip(executor), err)]
pub async fn reap_stale<'a, E>(executor: E, older_than: Span) -> Result<u64>
where
    E: PgExecutor<'a>,
{
    let older_than_secs = std::time::Duration::try_from(older_than)?.as_secs_f64();

    let reaped = sqlx::query_scalar::<_, i64>(
        r#"
        with stale as (
            select id
            from courier.job
            where state in ($1, $2)
              and updated_at < now() - make_interval(secs => $3)
            for update skip locked
        ),
        reaped as (
            update courier.job j
            set state = $4,
                retry_count = j.retry_count + 1,
                last_error = coalesce(j.last_error, 'request abandoned: no response collected'),
                updated_at = now()
            from stale
            where j.id = stale.id
            returning j.id
        ),
        dropped as (
            delete from courier.in_flight_handle h
            using reaped
            where h.job_id = reaped.id
        )
        select count(*) from reaped
        "#,
    )
    .bind(State::Dispatching)
    .bind(State::InFlight)
    .bind(older_than_secs)
    .bind(State::Failed)
    .fetch_one(executor)
    .await?;

    Ok(reaped as u64)
}

/// Runs deletion clean up of expired terminal jobs in a loop, sleeping
/// between deletions for the specified period.
///
/// **Note:** Jobs are only deleted when this routine or `run_deletion` is
/// running.
///
/// # Errors
///
/// This function returns an error if:
///
/// - The database operation fails during deletion.
pub async fn run_deletion_every(pool: &PgPool, period: Span) -> Result {
    let mut interval = tokio::time::interval(period.try_into()?);
    interval.tick().await;
    loop {
        delete_expired(pool).await?;
        interval.tick().await;
    }
}

/// Runs deletion clean up of expired terminal jobs every hour.
///
/// **Note:** Jobs are only deleted when this routine or `run_deletion_every`
/// is running.
///
/// # Errors
///
/// This function returns an error if:
///
/// - The database operation fails during deletion.
pub async fn run_deletion(pool: &PgPool) -> Result {
    run_deletion_every(pool, 1.hour()).await
}

#[instrument(skip(executor), err)]
async fn delete_expired<'a, E>(executor: E) -> Result
where
    E: PgExecutor<'a>,
{
    sqlx::query(
        r#"
        delete from courier.job
        where (state = $1 or state = $2)
          and created_at < now() - make_interval(days => $3)
        "#,
    )
    .bind(State::Complete)
    .bind(State::Failed)
    .bind(JOB_TTL_DAYS)
    .execute(executor)
    .await?;

    Ok(())
}
