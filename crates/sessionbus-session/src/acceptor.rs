//! Session acceptor: negotiates exclusive ownership of a session.

use std::{sync::Arc, time::Duration};

use sessionbus_core::{
    ClientSettings, Error, LinkFactory, ReceiveMode, Result, SessionId,
    protocol::{RequestBody, ResponseBody},
};
use sessionbus_link::{PendingResponse, RequestResponseChannel};
use tokio::time::Instant;

use crate::{handle::MessageSession, lifecycle::unexpected_response};

fn abandoned() -> Error {
    Error::Communication("session acceptance abandoned".to_string())
}

/// Accepts sessions on behalf of a client.
///
/// Each accepted session gets its own link; the acceptor itself holds no
/// session state and may be shared freely.
#[derive(Clone)]
pub struct SessionAcceptor {
    factory: Arc<dyn LinkFactory>,
    settings: ClientSettings,
}

impl SessionAcceptor {
    /// Create an acceptor opening links through `factory`.
    #[must_use]
    pub fn new(factory: Arc<dyn LinkFactory>, settings: ClientSettings) -> Self {
        Self { factory, settings }
    }

    /// Settings applied to every accepted session.
    #[must_use]
    pub const fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Accept a session within the operation timeout.
    ///
    /// With `session_id` that session is requested; otherwise any session
    /// with available messages.
    ///
    /// # Errors
    /// See [`Self::accept_session_with_timeout`].
    pub async fn accept_session(
        &self,
        entity_path: &str,
        session_id: Option<&str>,
        receive_mode: ReceiveMode,
    ) -> Result<MessageSession> {
        self.accept_session_with_timeout(
            entity_path,
            session_id,
            receive_mode,
            self.settings.operation_timeout,
        )
        .await
    }

    /// Accept a session within `timeout`.
    ///
    /// On timeout no session is left locked on behalf of this call: a grant
    /// that arrives afterwards is released in the background.
    ///
    /// # Errors
    /// - `Error::Timeout` if no session was granted in time
    /// - `Error::SessionCannotBeLocked` if the named session is held elsewhere
    /// - `Error::EntityNotFound` / `Error::Unauthorized` from link setup
    pub async fn accept_session_with_timeout(
        &self,
        entity_path: &str,
        session_id: Option<&str>,
        receive_mode: ReceiveMode,
        timeout: Duration,
    ) -> Result<MessageSession> {
        let deadline = Instant::now() + timeout;
        let requested = session_id.map(str::to_string);

        let session = self
            .settings
            .retry_policy
            .run("accept_session", deadline, |_| {
                self.try_accept(entity_path, requested.clone(), receive_mode, deadline, timeout)
            })
            .await?;

        tracing::info!(
            session_id = %session.session_id(),
            entity_path,
            ?receive_mode,
            locked_until = %session.locked_until(),
            "session accepted"
        );
        Ok(session)
    }

    async fn try_accept(
        &self,
        entity_path: &str,
        session_id: Option<SessionId>,
        receive_mode: ReceiveMode,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<MessageSession> {
        let timed_out = || {
            Error::Timeout(format!(
                "no session accepted on {entity_path} within {timeout:?}"
            ))
        };

        let channel = tokio::time::timeout_at(
            deadline,
            RequestResponseChannel::open(self.factory.as_ref(), entity_path, &self.settings),
        )
        .await
        .map_err(|_| timed_out())??;

        let server_timeout = deadline.saturating_duration_since(Instant::now());
        let body = RequestBody::AcceptSession {
            session_id,
            receive_mode,
            server_timeout_ms: u64::try_from(server_timeout.as_millis()).unwrap_or(u64::MAX),
        };

        let mut pending = match tokio::time::timeout_at(deadline, channel.start(body)).await {
            Ok(Ok(pending)) => pending,
            Ok(Err(e)) => {
                channel.close(abandoned).await;
                return Err(e);
            }
            Err(_) => {
                channel.close(abandoned).await;
                return Err(timed_out());
            }
        };

        match tokio::time::timeout_at(deadline, &mut pending).await {
            Ok(Ok(ResponseBody::SessionAccepted {
                session_id,
                locked_until,
            })) => {
                drop(pending);
                Ok(MessageSession::new(
                    session_id,
                    receive_mode,
                    locked_until,
                    channel,
                    &self.settings,
                ))
            }
            Ok(outcome) => {
                drop(pending);
                channel.close(abandoned).await;
                match outcome {
                    Ok(other) => Err(unexpected_response("accept_session", &other)),
                    Err(e) => Err(e),
                }
            }
            Err(_) => {
                tokio::spawn(release_late_grant(
                    channel,
                    pending,
                    self.settings.operation_timeout,
                ));
                Err(timed_out())
            }
        }
    }
}

/// Wait for a grant that may still be in flight and give it back.
async fn release_late_grant(
    channel: RequestResponseChannel,
    pending: PendingResponse,
    grace: Duration,
) {
    if let Ok(Ok(ResponseBody::SessionAccepted { session_id, .. })) =
        tokio::time::timeout(grace, pending).await
    {
        tracing::warn!(
            %session_id,
            entity_path = %channel.entity_path(),
            "releasing session granted after accept timed out"
        );
        let body = RequestBody::CloseSession {
            session_id: session_id.clone(),
        };
        if let Err(e) = channel.request(body, grace).await {
            tracing::warn!(%session_id, error = %e, "failed to release late session grant");
        }
    }
    channel.close(abandoned).await;
}
