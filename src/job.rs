//! Jobs are the unit of work: one outbound HTTP request, tracked durably.
//!
//! A job is created via [`submit`](crate::Queue::submit) (usually through
//! [`Courier::submit`](crate::Courier::submit)) and then advances through the
//! states described by [`State`]: it is dispatched as an outbound request,
//! its response is reconciled asynchronously, and it ends up either
//! `complete` or `failed`. The payload and target path are opaque to the
//! queue; only the request method is validated.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::timestamp::Timestamp;

/// Unique identifier of a job.
///
/// Identifiers are ULIDs generated at submission and stored as `uuid`, so
/// they sort by creation time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Ulid::new().into())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

/// Request verbs a job may carry.
///
/// The set is validated at the type boundary: parsing anything else fails
/// with [`UnsupportedMethod`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "courier.request_method", rename_all = "UPPERCASE")]
pub enum Method {
    /// An HTTP `GET`; the payload becomes query parameters.
    Get,

    /// An HTTP `POST`; the payload becomes the JSON body.
    Post,

    /// An HTTP `DELETE`; the payload becomes query parameters.
    Delete,
}

impl Method {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error indicating a request method outside the supported set.
#[derive(Debug, thiserror::Error)]
#[error("Unsupported request method: {0}")]
pub struct UnsupportedMethod(pub String);

impl FromStr for Method {
    type Err = UnsupportedMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("GET") {
            Ok(Method::Get)
        } else if s.eq_ignore_ascii_case("POST") {
            Ok(Method::Post)
        } else if s.eq_ignore_ascii_case("DELETE") {
            Ok(Method::Delete)
        } else {
            Err(UnsupportedMethod(s.to_string()))
        }
    }
}

/// Represents the possible states of a job.
///
/// State is mutated only by the queue and always advances through the same
/// machine: `queued -> dispatching -> in_flight -> complete | failed`, with
/// `failed` re-entering `dispatching` while retries remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, sqlx::Type)]
#[sqlx(type_name = "courier.job_state", rename_all = "snake_case")]
pub enum State {
    /// Submitted but not yet picked up for dispatch.
    Queued,

    /// Claimed for dispatch; the outbound request is being issued.
    Dispatching,

    /// The request was issued and a live handle awaits reconciliation.
    InFlight,

    /// The response arrived with a success status. Terminal.
    Complete,

    /// The last attempt failed. Terminal once `retry_count == retry_limit`.
    Failed,
}

impl State {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            State::Queued => "queued",
            State::Dispatching => "dispatching",
            State::InFlight => "in_flight",
            State::Complete => "complete",
            State::Failed => "failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job row as observed via [`Queue::job`](crate::Queue::job).
///
/// External callers poll this to observe terminal outcomes; `result_body` is
/// populated only once the job is `complete` and `last_error` carries the
/// most recent transport failure detail, if any.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    /// Unique, immutable identifier assigned at submission.
    pub id: JobId,

    /// Request verb, validated at submission.
    pub method: Method,

    /// Opaque path appended to the base destination.
    pub target_path: String,

    /// Opaque structured payload; never interpreted by the queue.
    pub payload: serde_json::Value,

    /// Current position in the job state machine.
    pub state: State,

    /// Number of recorded failures so far.
    pub retry_count: i32,

    /// Ceiling on total dispatch attempts, fixed at submission.
    pub retry_limit: i32,

    /// Response body, present only on `complete`.
    pub result_body: Option<String>,

    /// Detail of the most recent dispatch or transport failure.
    pub last_error: Option<String>,

    /// When the job was submitted.
    pub created_at: Timestamp,

    /// When the job row last changed.
    pub updated_at: Timestamp,

    /// When the job reached `complete`.
    pub completed_at: Option<Timestamp>,
}

impl Job {
    /// Whether the job has reached a state it can no longer leave.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            State::Complete => true,
            State::Failed => self.retry_count >= self.retry_limit,
            _ => false,
        }
    }
}

/// A new job to be submitted.
///
/// # Example
///
/// ```rust
/// use courier::Submission;
/// use serde_json::json;
///
/// let submission = Submission::post("/ingest")
///     .payload(json!({"x": 1}))
///     .retry_limit(3);
/// ```
#[derive(Debug, Clone)]
pub struct Submission {
    pub(crate) method: Method,
    pub(crate) target_path: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) retry_limit: Option<i32>,
}

impl Submission {
    /// Creates a submission with the given method and target path.
    pub fn new(method: Method, target_path: impl Into<String>) -> Self {
        Self {
            method,
            target_path: target_path.into(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
            retry_limit: None,
        }
    }

    /// Shorthand for a `GET` submission.
    pub fn get(target_path: impl Into<String>) -> Self {
        Self::new(Method::Get, target_path)
    }

    /// Shorthand for a `POST` submission.
    pub fn post(target_path: impl Into<String>) -> Self {
        Self::new(Method::Post, target_path)
    }

    /// Shorthand for a `DELETE` submission.
    pub fn delete(target_path: impl Into<String>) -> Self {
        Self::new(Method::Delete, target_path)
    }

    /// Sets the opaque payload.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the retry limit, overriding the queue's default.
    ///
    /// The limit bounds total dispatch attempts and must be at least one.
    pub fn retry_limit(mut self, retry_limit: i32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parses_supported_verbs() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("POST".parse::<Method>().unwrap(), Method::Post);
        assert_eq!("DELETE".parse::<Method>().unwrap(), Method::Delete);

        // Case-insensitive, as HTTP verbs conventionally are.
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("Post".parse::<Method>().unwrap(), Method::Post);
    }

    #[test]
    fn method_rejects_unsupported_verbs() {
        for verb in ["PUT", "PATCH", "HEAD", ""] {
            let err = verb.parse::<Method>().unwrap_err();
            assert_eq!(err.to_string(), format!("Unsupported request method: {verb}"));
        }
    }

    #[test]
    fn submission_defaults() {
        let submission = Submission::get("/status");
        assert_eq!(submission.method, Method::Get);
        assert_eq!(submission.target_path, "/status");
        assert_eq!(submission.payload, serde_json::json!({}));
        assert!(submission.retry_limit.is_none());
    }

    #[test]
    fn job_ids_sort_by_creation() {
        let first = JobId::new();
        // ULIDs only order across distinct milliseconds.
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = JobId::new();
        assert!(first < second);
    }
}
