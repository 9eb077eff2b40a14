//! Session handle state machine.
//!
//! `Active` is the only state that accepts work. `Closed` and `Expired` are
//! terminal. Every broker response is re-validated against the current state,
//! so a response that arrives after the lock was lost or the handle closed is
//! never reported as success.

use std::time::Duration;

use parking_lot::Mutex;
use sessionbus_core::{
    ClientSettings, Error, HandleState, ReceiveMode, Result, RetryPolicy, SessionId,
    protocol::{RequestBody, ResponseBody},
};
use sessionbus_link::RequestResponseChannel;
use tokio::time::Instant;

/// Shared core of a session handle: identity, channel and state.
pub(crate) struct SessionLifecycle {
    session_id: SessionId,
    entity_path: String,
    receive_mode: ReceiveMode,
    channel: RequestResponseChannel,
    retry_policy: RetryPolicy,
    operation_timeout: Duration,
    state: Mutex<HandleState>,
}

impl SessionLifecycle {
    pub(crate) fn new(
        session_id: SessionId,
        receive_mode: ReceiveMode,
        channel: RequestResponseChannel,
        settings: &ClientSettings,
    ) -> Self {
        Self {
            session_id,
            entity_path: channel.entity_path().to_string(),
            receive_mode,
            channel,
            retry_policy: settings.retry_policy.clone(),
            operation_timeout: settings.operation_timeout,
            state: Mutex::new(HandleState::Active),
        }
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn entity_path(&self) -> &str {
        &self.entity_path
    }

    pub(crate) const fn receive_mode(&self) -> ReceiveMode {
        self.receive_mode
    }

    pub(crate) const fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub(crate) fn state(&self) -> HandleState {
        *self.state.lock()
    }

    /// Fail with `IllegalState` unless the handle is `Active`.
    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state() {
            HandleState::Active => Ok(()),
            state => Err(self.illegal_state(state)),
        }
    }

    fn illegal_state(&self, state: HandleState) -> Error {
        Error::IllegalState {
            session_id: self.session_id.clone(),
            state,
        }
    }

    fn lock_lost(&self) -> Error {
        Error::SessionLockLost {
            session_id: self.session_id.clone(),
        }
    }

    /// Run a request under the operation timeout.
    pub(crate) async fn execute(&self, body: RequestBody) -> Result<ResponseBody> {
        self.execute_with_timeout(body, self.operation_timeout).await
    }

    /// Run a request, retrying transient failures until `timeout` elapses.
    pub(crate) async fn execute_with_timeout(
        &self,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<ResponseBody> {
        self.ensure_active()?;

        let operation = body.operation();
        let deadline = Instant::now() + timeout;
        let outcome = self
            .retry_policy
            .run(operation, deadline, |remaining| {
                let body = body.clone();
                async move {
                    self.ensure_active()?;
                    self.channel.request(body, remaining).await
                }
            })
            .await;

        self.validate(operation, outcome)
    }

    fn validate(&self, operation: &str, outcome: Result<ResponseBody>) -> Result<ResponseBody> {
        if self.state() == HandleState::Closed {
            return Err(self.illegal_state(HandleState::Closed));
        }
        match outcome {
            Err(e @ Error::SessionLockLost { .. }) => {
                self.mark_expired(operation, &e);
                Err(self.lock_lost())
            }
            outcome if self.state() == HandleState::Expired => {
                if let Err(e) = &outcome {
                    tracing::debug!(
                        session_id = %self.session_id,
                        operation,
                        error = %e,
                        "operation failed after session lock was lost"
                    );
                }
                Err(self.lock_lost())
            }
            outcome => outcome,
        }
    }

    /// Move `Active -> Expired` and fail every pending request.
    pub(crate) fn mark_expired(&self, operation: &str, cause: &Error) {
        {
            let mut state = self.state.lock();
            if *state != HandleState::Active {
                return;
            }
            *state = HandleState::Expired;
        }

        let failed = self.channel.fail_pending(|| self.lock_lost());
        tracing::warn!(
            session_id = %self.session_id,
            entity_path = %self.entity_path,
            operation,
            failed,
            error = %cause,
            "session lock lost"
        );
    }

    /// Close the handle. Idempotent.
    ///
    /// The first call from `Active` releases the session lock on the broker
    /// (best effort, bounded by the operation timeout). The channel is closed
    /// in every case; requests still pending fail with `IllegalState(Closed)`.
    pub(crate) async fn close(&self) {
        let was_active = {
            let mut state = self.state.lock();
            let was_active = *state == HandleState::Active;
            if was_active {
                *state = HandleState::Closed;
            }
            was_active
        };

        if was_active {
            let body = RequestBody::CloseSession {
                session_id: self.session_id.clone(),
            };
            match self.channel.request(body, self.operation_timeout).await {
                Ok(_) => tracing::info!(
                    session_id = %self.session_id,
                    entity_path = %self.entity_path,
                    "session closed"
                ),
                Err(e) => tracing::warn!(
                    session_id = %self.session_id,
                    entity_path = %self.entity_path,
                    error = %e,
                    "failed to release session lock on close"
                ),
            }
        }

        self.channel
            .close(|| self.illegal_state(HandleState::Closed))
            .await;
    }
}

/// Error for a response of the wrong shape.
pub(crate) fn unexpected_response(operation: &str, body: &ResponseBody) -> Error {
    Error::Protocol(format!("unexpected {} response to {operation}", body.name()))
}
