//! Worker slots bound how many reconciliation passes may run at once.
//!
//! The pool is a fixed set of rows provisioned once at setup. Leasing is a
//! try-acquire over those rows: a free slot is selected with
//! `FOR UPDATE SKIP LOCKED`, marked leased for the duration of the leased
//! closure, and released on every exit path. When every slot is leased the
//! attempt returns immediately without running anything — excess scheduler
//! ticks are dropped, never queued.

use std::future::Future;

use sqlx::{PgExecutor, PgPool};
use tracing::instrument;

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// Slot pool errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Fixed pool of worker slots.
///
/// Cheap to clone; clones share the same connection pool and therefore the
/// same slots.
#[derive(Debug, Clone)]
pub struct SlotPool {
    pool: PgPool,
}

impl SlotPool {
    /// Creates a handle to the worker slot pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The default pool size: one slot per available CPU.
    pub fn default_size() -> i32 {
        num_cpus::get() as i32
    }

    /// Fixes the pool at exactly `size` slots.
    ///
    /// Idempotent: missing slots are created and slots beyond `size` are
    /// removed. Intended for setup time; resizing while schedulers are
    /// running is not supported.
    #[instrument(skip(executor), err)]
    pub async fn provision<'a, E>(executor: E, size: i32) -> Result
    where
        E: PgExecutor<'a>,
    {
        sqlx::query(
            r#"
            with trimmed as (
                delete from courier.worker_slot
                where id > $1
            )
            insert into courier.worker_slot (id)
            select generate_series(1, $1)
            on conflict (id) do nothing
            "#,
        )
        .bind(size)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Runs `f` under a leased slot, or returns `None` right away when no
    /// slot is free.
    ///
    /// The slot is released before this returns, on every exit path —
    /// including when `f` resolves to an error value.
    pub async fn with_leased_slot<F, Fut, O>(&self, f: F) -> Result<Option<O>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = O>,
    {
        let Some(slot_id) = self.try_acquire().await? else {
            return Ok(None);
        };

        let output = f().await;

        self.release(slot_id).await?;

        Ok(Some(output))
    }

    /// Attempts to lease one free slot without waiting.
    ///
    /// Already-leased slots, and free slots another leaser is concurrently
    /// claiming, are skipped rather than waited on.
    #[instrument(skip(self), fields(slot.id = tracing::field::Empty), err)]
    async fn try_acquire(&self) -> Result<Option<i32>> {
        let mut tx = self.pool.begin().await?;

        let Some(slot_id) = sqlx::query_scalar::<_, i32>(
            r#"
            select id
            from courier.worker_slot
            where not leased
            order by id
            limit 1
            for update skip locked
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            update courier.worker_slot
            set leased = true,
                leased_at = now()
            where id = $1
            "#,
        )
        .bind(slot_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::Span::current().record("slot.id", slot_id);

        Ok(Some(slot_id))
    }

    async fn release(&self, slot_id: i32) -> Result {
        sqlx::query(
            r#"
            update courier.worker_slot
            set leased = false,
                leased_at = null
            where id = $1
            "#,
        )
        .bind(slot_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
