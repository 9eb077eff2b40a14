//! Session and message lock renewal.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sessionbus_core::{
    Error, ReceiveMode, ReceivedMessage, Result,
    protocol::{RequestBody, ResponseBody},
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::lifecycle::{SessionLifecycle, unexpected_response};

/// Upper bound on how early auto-renewal fires before the lock expires.
const MAX_RENEW_MARGIN: Duration = Duration::from_secs(10);

/// Pause after a transient auto-renewal failure.
const AUTO_RENEW_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Renews the session lock and caches its expiry.
///
/// The cache only moves forward: concurrent renewals may complete in any
/// order, and the cached value is the latest expiry any of them returned.
pub(crate) struct LockRenewer {
    lifecycle: Arc<SessionLifecycle>,
    locked_until: RwLock<DateTime<Utc>>,
}

impl LockRenewer {
    pub(crate) fn new(lifecycle: Arc<SessionLifecycle>, locked_until: DateTime<Utc>) -> Self {
        Self {
            lifecycle,
            locked_until: RwLock::new(locked_until),
        }
    }

    pub(crate) fn locked_until(&self) -> DateTime<Utc> {
        *self.locked_until.read()
    }

    fn observe(&self, locked_until: DateTime<Utc>) {
        let mut cached = self.locked_until.write();
        if locked_until > *cached {
            *cached = locked_until;
        }
    }

    pub(crate) async fn renew_session_lock(&self) -> Result<DateTime<Utc>> {
        let body = RequestBody::RenewSessionLock {
            session_id: self.lifecycle.session_id().to_string(),
        };
        let locked_until = self.expect_renewed(body).await?;
        tracing::debug!(
            session_id = %self.lifecycle.session_id(),
            %locked_until,
            "session lock renewed"
        );
        Ok(locked_until)
    }

    pub(crate) async fn renew_message_lock(
        &self,
        message: &ReceivedMessage,
    ) -> Result<DateTime<Utc>> {
        self.lifecycle.ensure_active()?;
        if self.lifecycle.receive_mode() == ReceiveMode::ReceiveAndDelete {
            return Err(Error::InvalidOperation(
                "message locks do not exist in receive-and-delete mode".to_string(),
            ));
        }
        let lock_token = message.lock_token.ok_or_else(|| {
            Error::InvalidOperation(format!(
                "message {} was not received under a lock",
                message.sequence_number
            ))
        })?;

        let body = RequestBody::RenewMessageLock {
            session_id: self.lifecycle.session_id().to_string(),
            lock_tokens: vec![lock_token],
        };
        let locked_until = self.expect_renewed(body).await?;
        tracing::debug!(
            session_id = %self.lifecycle.session_id(),
            %lock_token,
            %locked_until,
            "message lock renewed"
        );
        Ok(locked_until)
    }

    async fn expect_renewed(&self, body: RequestBody) -> Result<DateTime<Utc>> {
        let operation = body.operation();
        match self.lifecycle.execute(body).await? {
            ResponseBody::LockRenewed { locked_until } => {
                self.observe(locked_until);
                Ok(locked_until)
            }
            other => Err(unexpected_response(operation, &other)),
        }
    }
}

/// Handle to a background auto-renewal task.
///
/// Renewal stops when the guard is cancelled or dropped, when its maximum
/// duration elapses, or when the session leaves `Active`.
#[must_use = "auto-renewal stops when the guard is dropped"]
pub struct AutoRenewGuard {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AutoRenewGuard {
    /// Stop renewing.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the renewal task has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop renewing and wait for the task to exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AutoRenewGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub(crate) fn spawn_auto_renew(
    lifecycle: Arc<SessionLifecycle>,
    renewer: Arc<LockRenewer>,
    max_duration: Duration,
) -> AutoRenewGuard {
    let token = CancellationToken::new();
    let task = tokio::spawn(auto_renew_loop(
        lifecycle,
        renewer,
        Instant::now() + max_duration,
        token.clone(),
    ));
    AutoRenewGuard {
        token,
        task: Some(task),
    }
}

/// Delay before the next renewal: shortly before the cached expiry.
fn next_renewal_delay(locked_until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let remaining = (locked_until - now).to_std().unwrap_or_default();
    let margin = (remaining / 2).min(MAX_RENEW_MARGIN);
    remaining - margin
}

async fn auto_renew_loop(
    lifecycle: Arc<SessionLifecycle>,
    renewer: Arc<LockRenewer>,
    stop_at: Instant,
    token: CancellationToken,
) {
    let session_id = lifecycle.session_id().to_string();
    tracing::debug!(%session_id, "auto-renewal started");

    loop {
        let delay = next_renewal_delay(renewer.locked_until(), Utc::now());
        let wake_at = (Instant::now() + delay).min(stop_at);
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep_until(wake_at) => {}
        }
        if Instant::now() >= stop_at || lifecycle.ensure_active().is_err() {
            break;
        }

        match renewer.renew_session_lock().await {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!(%session_id, error = %e, "auto-renewal attempt failed");
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(AUTO_RENEW_RETRY_DELAY) => {}
                }
            }
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "auto-renewal stopped");
                break;
            }
        }
    }

    tracing::debug!(%session_id, "auto-renewal finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_fires_before_expiry() {
        let now = Utc::now();
        let delay = next_renewal_delay(now + chrono::Duration::seconds(30), now);
        assert_eq!(delay, Duration::from_secs(20));

        let delay = next_renewal_delay(now + chrono::Duration::seconds(4), now);
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn test_expired_lock_renews_immediately() {
        let now = Utc::now();
        let delay = next_renewal_delay(now - chrono::Duration::seconds(1), now);
        assert_eq!(delay, Duration::ZERO);
    }
}
