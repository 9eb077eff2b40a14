//! Client settings consumed by the session layer.

use std::{fmt, sync::Arc, time::Duration};

use crate::{RetryPolicy, traits::TokenProvider};

/// Default bound for every network-facing call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on requests in flight per link.
pub const DEFAULT_MAX_IN_FLIGHT_REQUESTS: usize = 1000;

/// Settings shared by every link a client opens.
///
/// Supplied externally; the client honours the operation timeout on every
/// network call and applies the retry policy to transient errors only.
#[derive(Clone)]
pub struct ClientSettings {
    /// Credential source.
    pub token_provider: Arc<dyn TokenProvider>,
    /// Retry policy for transient failures.
    pub retry_policy: RetryPolicy,
    /// Deadline for each network-facing call.
    pub operation_timeout: Duration,
    /// Requests allowed in flight on one link before callers queue.
    pub max_in_flight_requests: usize,
}

impl ClientSettings {
    /// Create settings with default retry policy and timeouts.
    #[must_use]
    pub fn new(token_provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            token_provider,
            retry_policy: RetryPolicy::default(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_in_flight_requests: DEFAULT_MAX_IN_FLIGHT_REQUESTS,
        }
    }

    /// Create settings with an explicit retry policy and operation timeout.
    #[must_use]
    pub fn with_policy(
        token_provider: Arc<dyn TokenProvider>,
        retry_policy: RetryPolicy,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            token_provider,
            retry_policy,
            operation_timeout,
            max_in_flight_requests: DEFAULT_MAX_IN_FLIGHT_REQUESTS,
        }
    }

    /// Set the operation timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set the in-flight request bound (at least one).
    #[must_use]
    pub fn with_max_in_flight_requests(mut self, max: usize) -> Self {
        self.max_in_flight_requests = max.max(1);
        self
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("retry_policy", &self.retry_policy)
            .field("operation_timeout", &self.operation_timeout)
            .field("max_in_flight_requests", &self.max_in_flight_requests)
            .finish_non_exhaustive()
    }
}
