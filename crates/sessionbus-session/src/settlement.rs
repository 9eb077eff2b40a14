//! Message settlement within a session.

use std::sync::Arc;

use sessionbus_core::{
    Error, MessageRef, ReceiveMode, Result,
    protocol::{Disposition, RequestBody, ResponseBody},
};

use crate::lifecycle::{SessionLifecycle, unexpected_response};

/// Sends dispositions for messages received under the session lock.
pub(crate) struct SettlementChannel {
    lifecycle: Arc<SessionLifecycle>,
}

impl SettlementChannel {
    pub(crate) const fn new(lifecycle: Arc<SessionLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Settle one message.
    ///
    /// Nothing is sent in receive-and-delete mode: delivery already removed
    /// the message, so there is no lock to settle.
    pub(crate) async fn settle(&self, target: MessageRef, disposition: Disposition) -> Result<()> {
        self.lifecycle.ensure_active()?;
        if self.lifecycle.receive_mode() == ReceiveMode::ReceiveAndDelete {
            return Err(Error::InvalidOperation(format!(
                "{} is not supported in receive-and-delete mode",
                disposition.name()
            )));
        }

        let kind = disposition.name();
        let body = RequestBody::Settle {
            session_id: self.lifecycle.session_id().to_string(),
            target,
            disposition,
        };
        let operation = body.operation();

        match self.lifecycle.execute(body).await {
            Ok(ResponseBody::Ack) => {
                tracing::debug!(
                    session_id = %self.lifecycle.session_id(),
                    %target,
                    disposition = kind,
                    "message settled"
                );
                Ok(())
            }
            Ok(other) => Err(unexpected_response(operation, &other)),
            Err(e) => {
                if matches!(e, Error::MessageLockLost { .. }) {
                    tracing::debug!(
                        session_id = %self.lifecycle.session_id(),
                        %target,
                        disposition = kind,
                        "message lock already released"
                    );
                }
                Err(e)
            }
        }
    }
}
