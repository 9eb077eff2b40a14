//! Receiving and browsing messages within a session.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use sessionbus_core::{
    Error, ReceivedMessage, Result,
    protocol::{RequestBody, ResponseBody},
};

use crate::lifecycle::{SessionLifecycle, unexpected_response};

/// Default wait for a single receive.
pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(60);

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn batch_size(max_messages: usize) -> Result<u32> {
    if max_messages == 0 {
        return Err(Error::InvalidOperation(
            "max_messages must be at least 1".to_string(),
        ));
    }
    Ok(u32::try_from(max_messages).unwrap_or(u32::MAX))
}

/// Pulls messages from the session and keeps the browse cursor.
pub(crate) struct SessionReceiver {
    lifecycle: Arc<SessionLifecycle>,
    /// Next sequence number `peek` starts from.
    peek_cursor: AtomicI64,
}

impl SessionReceiver {
    pub(crate) const fn new(lifecycle: Arc<SessionLifecycle>) -> Self {
        Self {
            lifecycle,
            peek_cursor: AtomicI64::new(0),
        }
    }

    pub(crate) async fn receive_batch(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let body = RequestBody::Receive {
            session_id: self.lifecycle.session_id().to_string(),
            max_messages: batch_size(max_messages)?,
            max_wait_ms: millis(max_wait),
        };
        // The broker may hold the request for the full wait.
        let timeout = max_wait.saturating_add(self.lifecycle.operation_timeout());
        let messages = self.expect_messages(body, timeout).await?;
        tracing::trace!(
            session_id = %self.lifecycle.session_id(),
            received = messages.len(),
            "receive completed"
        );
        Ok(messages)
    }

    pub(crate) async fn receive_deferred_batch(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>> {
        if sequence_numbers.is_empty() {
            return Ok(Vec::new());
        }
        let body = RequestBody::ReceiveBySequenceNumbers {
            session_id: self.lifecycle.session_id().to_string(),
            sequence_numbers: sequence_numbers.to_vec(),
        };
        self.expect_messages(body, self.lifecycle.operation_timeout())
            .await
    }

    pub(crate) async fn peek_batch(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        let from = self.peek_cursor.load(Ordering::Acquire);
        self.peek_from(from, max_messages).await
    }

    pub(crate) async fn peek_from(
        &self,
        from_sequence_number: i64,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>> {
        let body = RequestBody::Peek {
            session_id: self.lifecycle.session_id().to_string(),
            from_sequence_number,
            max_messages: batch_size(max_messages)?,
        };
        let messages = self
            .expect_messages(body, self.lifecycle.operation_timeout())
            .await?;

        if let Some(last) = messages.last() {
            self.peek_cursor
                .store(last.sequence_number + 1, Ordering::Release);
        }
        Ok(messages)
    }

    async fn expect_messages(
        &self,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let operation = body.operation();
        match self.lifecycle.execute_with_timeout(body, timeout).await? {
            ResponseBody::Messages { messages } => Ok(messages),
            other => Err(unexpected_response(operation, &other)),
        }
    }
}
