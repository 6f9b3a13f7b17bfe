//! Retry policies decide whether a failed job goes around again.
//!
//! The decision itself is deliberately small: a job is retryable while its
//! recorded failure count is below its limit, and terminal afterwards. There
//! is no per-retry backoff calculation; failed jobs wait for the next retry
//! sweep, so the sweep cadence *is* the backoff interval.

/// Configuration of a policy for retries in case of job failure.
///
/// # Example
///
/// ```rust
/// use courier::RetryPolicy;
///
/// let retry_policy = RetryPolicy::builder()
///     .default_retry_limit(3)
///     .sweep_batch_size(50)
///     .build();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub(crate) default_retry_limit: i32,
    pub(crate) sweep_batch_size: i64,
}

impl RetryPolicy {
    /// Create a new builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Whether a job with the given failure count may be dispatched again.
    ///
    /// This is the same predicate
    /// [`claim_retryable`](crate::Queue::claim_retryable) applies in SQL:
    /// strictly `retry_count < retry_limit`. Once the count reaches the
    /// limit the job is permanently terminal in the `failed` state.
    pub fn should_retry(&self, retry_count: i32, retry_limit: i32) -> bool {
        retry_count < retry_limit
    }
}

const DEFAULT_RETRY_POLICY: RetryPolicy = RetryPolicy {
    default_retry_limit: 10,
    sweep_batch_size: 100,
};

impl Default for RetryPolicy {
    fn default() -> Self {
        DEFAULT_RETRY_POLICY
    }
}

/// A builder for constructing custom [`RetryPolicy`] values.
#[derive(Debug, Default)]
pub struct Builder {
    inner: RetryPolicy,
}

impl Builder {
    /// Creates a new `Builder` with the default retry settings.
    pub const fn new() -> Self {
        Self {
            inner: DEFAULT_RETRY_POLICY,
        }
    }

    /// Sets the retry limit applied to submissions that don't carry one.
    ///
    /// Default value is `10`.
    pub const fn default_retry_limit(mut self, default_retry_limit: i32) -> Self {
        self.inner.default_retry_limit = default_retry_limit;
        self
    }

    /// Sets how many jobs a single dispatch or retry sweep may claim.
    ///
    /// Default value is `100`.
    pub const fn sweep_batch_size(mut self, sweep_batch_size: i64) -> Self {
        self.inner.sweep_batch_size = sweep_batch_size;
        self
    }

    /// Builds the `RetryPolicy` with the configured parameters.
    pub const fn build(self) -> RetryPolicy {
        self.inner
    }
}
