//! The in-flight tracker correlates outstanding requests back to jobs.
//!
//! Every dispatched request leaves exactly one handle row behind, recorded
//! in the same transaction that marks its job `in_flight`. The tracker's
//! [`reconcile_all`](Tracker::reconcile_all) pass later collects each
//! handle's disposition from the transport and drives the job to its
//! terminal state, deleting the handle the moment it resolves — regardless
//! of outcome.
//!
//! Reconciliation is safe to run from any number of workers at once. Each
//! pass snapshots the live handles and then re-claims every handle
//! individually with `FOR UPDATE SKIP LOCKED` in its own transaction:
//! concurrent passes partition the handle set, a handle can never resolve
//! twice, and one job's failure never aborts the rest of the pass. Handles
//! whose responses haven't arrived are simply left for a later pass.

use sqlx::PgExecutor;
use tracing::instrument;

use crate::{
    job::JobId,
    queue::{Error as QueueError, Queue},
    transport::{Disposition, Error as TransportError, HandleId, Transport},
};

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// Tracker errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned from queue operations.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Error returned from the transport while collecting a response.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reconciles outstanding handles against the transport.
#[derive(Debug, Clone)]
pub struct Tracker<T: Transport> {
    queue: Queue,
    transport: T,
}

impl<T: Transport> Tracker<T> {
    /// Creates a new tracker over the given queue and transport.
    pub const fn new(queue: Queue, transport: T) -> Self {
        Self { queue, transport }
    }

    /// Resolves every live handle whose response has arrived, returning how
    /// many were resolved.
    ///
    /// For each handle the collected disposition decides the job's fate:
    ///
    /// - Delivered with a status in `200..=299`: the job completes with the
    ///   response body.
    /// - Delivered with any other status, or failed outright: the job is
    ///   marked failed and proceeds through the retry path.
    /// - Still pending (or unknown to the transport): the handle stays put
    ///   for a later pass; this is not an error.
    #[instrument(skip(self), fields(resolved = tracing::field::Empty), err)]
    pub async fn reconcile_all(&self) -> Result<u64> {
        let handles = sqlx::query_as::<_, (HandleId, JobId)>(
            r#"
            select handle, job_id
            from courier.in_flight_handle
            order by created_at, handle
            "#,
        )
        .fetch_all(&self.queue.pool)
        .await?;

        let mut resolved = 0;
        for (handle, job_id) in handles {
            match self.reconcile_one(handle).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                // One job's failure must never abort the rest of the pass.
                Err(err) => {
                    tracing::error!(err = %err, job.id = %job_id, "Failed to reconcile handle");
                }
            }
        }

        tracing::Span::current().record("resolved", resolved);

        Ok(resolved)
    }

    /// Attempts to resolve a single handle, returning whether it did.
    ///
    /// Returns `false` when the handle is gone (a concurrent pass resolved
    /// it), currently claimed by another pass, or still pending.
    async fn reconcile_one(&self, handle: HandleId) -> Result<bool> {
        let mut tx = self.queue.pool.begin().await?;

        // Re-claim the handle; skip it if another pass holds or beat us to
        // it.
        let Some((handle, job_id)) = sqlx::query_as::<_, (HandleId, JobId)>(
            r#"
            select handle, job_id
            from courier.in_flight_handle
            where handle = $1
            for update skip locked
            "#,
        )
        .bind(handle)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(false);
        };

        let resolved = match self.transport.collect(handle).await? {
            Disposition::Pending => false,
            Disposition::Delivered { status, body } if (200..=299).contains(&status) => {
                self.queue.mark_complete(&mut *tx, job_id, &body).await?;
                delete_handle(&mut *tx, handle).await?;
                true
            }
            Disposition::Delivered { status, .. } => {
                self.queue
                    .mark_failed(&mut *tx, job_id, &format!("Remote responded with status {status}"))
                    .await?;
                delete_handle(&mut *tx, handle).await?;
                true
            }
            Disposition::Failed { message } => {
                self.queue.mark_failed(&mut *tx, job_id, &message).await?;
                delete_handle(&mut *tx, handle).await?;
                true
            }
        };

        tx.commit().await?;

        Ok(resolved)
    }
}

/// Records the handle for a just-dispatched job.
///
/// Callers are expected to pair this with
/// [`mark_in_flight`](Queue::mark_in_flight) in one transaction. The unique
/// constraint on `job_id` backs the invariant that a job has at most one
/// live handle.
pub(crate) async fn record_handle<'a, E>(
    executor: E,
    handle: HandleId,
    job_id: JobId,
) -> std::result::Result<(), sqlx::Error>
where
    E: PgExecutor<'a>,
{
    sqlx::query(
        r#"
        insert into courier.in_flight_handle (handle, job_id)
        values ($1, $2)
        "#,
    )
    .bind(handle)
    .bind(job_id)
    .execute(executor)
    .await?;

    Ok(())
}

async fn delete_handle<'a, E>(executor: E, handle: HandleId) -> std::result::Result<(), sqlx::Error>
where
    E: PgExecutor<'a>,
{
    sqlx::query("delete from courier.in_flight_handle where handle = $1")
        .bind(handle)
        .execute(executor)
        .await?;

    Ok(())
}
