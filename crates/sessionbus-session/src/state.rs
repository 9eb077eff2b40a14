//! Opaque per-session state.

use std::sync::Arc;

use sessionbus_core::{
    Result,
    protocol::{RequestBody, ResponseBody},
};

use crate::lifecycle::{SessionLifecycle, unexpected_response};

/// Reads and writes the state blob the broker keeps for the session.
pub(crate) struct SessionStateStore {
    lifecycle: Arc<SessionLifecycle>,
}

impl SessionStateStore {
    pub(crate) const fn new(lifecycle: Arc<SessionLifecycle>) -> Self {
        Self { lifecycle }
    }

    pub(crate) async fn get(&self) -> Result<Option<Vec<u8>>> {
        let body = RequestBody::GetSessionState {
            session_id: self.lifecycle.session_id().to_string(),
        };
        let operation = body.operation();
        match self.lifecycle.execute(body).await? {
            ResponseBody::SessionState { state } => Ok(state),
            other => Err(unexpected_response(operation, &other)),
        }
    }

    pub(crate) async fn set(&self, state: Option<&[u8]>) -> Result<()> {
        let size = state.map_or(0, <[u8]>::len);
        let body = RequestBody::SetSessionState {
            session_id: self.lifecycle.session_id().to_string(),
            state: state.map(<[u8]>::to_vec),
        };
        let operation = body.operation();
        match self.lifecycle.execute(body).await? {
            ResponseBody::Ack => {
                tracing::debug!(
                    session_id = %self.lifecycle.session_id(),
                    size,
                    "session state stored"
                );
                Ok(())
            }
            other => Err(unexpected_response(operation, &other)),
        }
    }
}
