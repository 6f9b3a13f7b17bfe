//! # Courier
//!
//! ⏳ Durable HTTP job dispatch via Postgres.
//!
//! # Overview
//!
//! **Courier** is a durable queue for outbound HTTP work, leveraging
//! PostgreSQL as its backing store. Jobs are submitted with an opaque JSON
//! payload and a target path, dispatched as HTTP requests with bounded
//! timeouts, and their responses are reconciled asynchronously back onto
//! the job row — so callers can always answer "what happened to request
//! X?" by polling a job ID.
//!
//! Key Features:
//!
//! - **PostgreSQL-Backed**: Leverages PostgreSQL with `FOR UPDATE SKIP
//!   LOCKED` for reliable job storage and coordination, ensuring efficient,
//!   safe concurrency across any number of worker processes.
//! - **Event-Driven Submission**: Submitting a job fires its dispatch
//!   exactly once, synchronously; periodic sweeps exist for recovery, not
//!   as the primary path.
//! - **Automatic Retries**: Failed requests are retried on a flat cadence
//!   up to a per-job limit, after which the job is permanently failed and
//!   inspectable.
//! - **Bounded Reconciliation**: A fixed pool of worker slots caps how many
//!   reconciliation passes run concurrently; excess ticks are dropped, not
//!   queued.
//! - **Transport-Agnostic Core**: Dispatch goes through a two-phase
//!   fire/collect [`Transport`] trait; the provided [`HttpTransport`] is
//!   `reqwest`-backed, but anything honoring the contract plugs in.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::env;
//!
//! use courier::{Courier, HttpTransport, Submission, Url};
//! use serde_json::json;
//! use sqlx::PgPool;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Set up the database connection pool.
//!     let database_url = &env::var("DATABASE_URL").expect("DATABASE_URL should be set");
//!     let pool = PgPool::connect(database_url).await?;
//!
//!     // Run migrations.
//!     courier::MIGRATOR.run(&pool).await?;
//!
//!     // Build the courier.
//!     let courier = Courier::builder()
//!         .pool(pool)
//!         .base_url(Url::parse("https://api.example.com")?)
//!         .transport(HttpTransport::new())
//!         .worker_slots(4)
//!         .build()
//!         .await?;
//!
//!     // Submit a job; it is dispatched immediately.
//!     let job_id = courier
//!         .submit(Submission::post("/ingest").payload(json!({"x": 1})))
//!         .await?;
//!
//!     // Observe the outcome by polling the job ID.
//!     if let Some(job) = courier.job(job_id).await? {
//!         println!("job {job_id} is {}", job.state);
//!     }
//!
//!     // Drive reconciliation, retries, and crash recovery.
//!     courier.scheduler().run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Concepts
//!
//! Courier is built from a handful of pieces, each owning one concern:
//!
//! - [Jobs](#jobs) are the durable unit of work.
//! - [The queue](#the-queue) keeps job state consistent.
//! - [Dispatch](#dispatch) turns a job into exactly one outbound request.
//! - [Reconciliation](#reconciliation) resolves outstanding requests.
//! - [Scheduling](#scheduling) drives everything periodically.
//!
//! ## Jobs
//!
//! A job pairs a validated request method with an opaque payload and target
//! path, plus retry bookkeeping. Its state machine is strictly linear per
//! attempt; a job carries at most one live request handle at any instant,
//! so its states can never interleave.
//!
//! See [`job`] for the data model.
//!
//! ## The queue
//!
//! The queue is the single writer of job rows. Work is claimed with
//! skip-locked selections that transition state in the same statement,
//! which is what lets many processes sweep concurrently without ever
//! double-claiming a job.
//!
//! See [`queue`] for details.
//!
//! ## Dispatch
//!
//! The dispatcher assembles the request — joined URL, payload as body or
//! query — and fires it through the transport, recording the returned
//! handle. Requests that cannot be issued at all consume a retry attempt
//! like any other failure.
//!
//! See [`dispatcher`] and [`transport`].
//!
//! ## Reconciliation
//!
//! The tracker collects each outstanding handle's disposition and drives
//! jobs to `complete` or `failed`, deleting the handle either way. Passes
//! partition the handle set via skip-locked claims, and how many passes
//! run at once is bounded by the worker slot pool.
//!
//! See [`tracker`] and [`slot`].
//!
//! ## Scheduling
//!
//! Schedulers tick on a timer: dispatch-sweep, reconcile under a leased
//! slot, and on a slower cadence retry failed jobs. Any number may run
//! anywhere; the database coordinates them.
//!
//! See [`scheduler`].

#![warn(clippy::all, nonstandard_style, future_incompatible, missing_docs)]

use sqlx::migrate::Migrator;

pub use reqwest::Url;

pub use crate::{
    client::Courier,
    dispatcher::Dispatcher,
    job::{Job, JobId, Method, State, Submission},
    queue::Queue,
    retry::RetryPolicy,
    scheduler::Scheduler,
    slot::SlotPool,
    timestamp::Timestamp,
    tracker::Tracker,
    transport::{Disposition, HandleId, HttpTransport, OutboundRequest, Transport},
};

pub mod client;
pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod slot;
mod timestamp;
pub mod tracker;
pub mod transport;

/// A SQLx [`Migrator`] which provides Courier's schema migrations.
///
/// These migrations must be applied before the queue, dispatcher, and
/// scheduler can be run.
///
/// **Note**: Changes are managed within a dedicated schema, called
/// "courier".
///
/// # Example
///
///```rust,no_run
/// # use tokio::runtime::Runtime;
/// use std::env;
///
/// use sqlx::PgPool;
///
/// # fn main() {
/// # let rt = Runtime::new().unwrap();
/// # rt.block_on(async {
/// // Set up the database connection pool.
/// let database_url = &env::var("DATABASE_URL")?;
/// let pool = PgPool::connect(database_url).await?;
///
/// // Run migrations.
/// courier::MIGRATOR.run(&pool).await?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// # }
pub static MIGRATOR: Migrator = sqlx::migrate!();
