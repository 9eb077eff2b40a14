//! The session handle.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sessionbus_core::{
    ClientSettings, DeadLetterOptions, Error, HandleState, LockToken, MessageRef, Properties,
    ReceiveMode, ReceivedMessage, Result, SessionId,
    protocol::Disposition,
};
use sessionbus_link::RequestResponseChannel;

use crate::{
    lifecycle::SessionLifecycle,
    receive::{DEFAULT_RECEIVE_WAIT, SessionReceiver},
    renewal::{AutoRenewGuard, LockRenewer, spawn_auto_renew},
    settlement::SettlementChannel,
    state::SessionStateStore,
};

/// Messages received per round while draining.
const DRAIN_BATCH: usize = 100;

/// An accepted session.
///
/// Holds the session lock until closed or until the broker reports the lock
/// lost. Cheap to clone; clones share one channel and one state machine, and
/// every operation can be issued concurrently.
#[derive(Clone)]
pub struct MessageSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    lifecycle: Arc<SessionLifecycle>,
    renewer: Arc<LockRenewer>,
    settlement: SettlementChannel,
    state: SessionStateStore,
    receiver: SessionReceiver,
}

impl MessageSession {
    pub(crate) fn new(
        session_id: SessionId,
        receive_mode: ReceiveMode,
        locked_until: DateTime<Utc>,
        channel: RequestResponseChannel,
        settings: &ClientSettings,
    ) -> Self {
        let lifecycle = Arc::new(SessionLifecycle::new(
            session_id,
            receive_mode,
            channel,
            settings,
        ));
        Self {
            inner: Arc::new(SessionInner {
                renewer: Arc::new(LockRenewer::new(Arc::clone(&lifecycle), locked_until)),
                settlement: SettlementChannel::new(Arc::clone(&lifecycle)),
                state: SessionStateStore::new(Arc::clone(&lifecycle)),
                receiver: SessionReceiver::new(Arc::clone(&lifecycle)),
                lifecycle,
            }),
        }
    }

    /// Session id granted by the broker.
    #[must_use]
    pub fn session_id(&self) -> &str {
        self.inner.lifecycle.session_id()
    }

    /// Entity the session belongs to.
    #[must_use]
    pub fn entity_path(&self) -> &str {
        self.inner.lifecycle.entity_path()
    }

    #[must_use]
    pub fn receive_mode(&self) -> ReceiveMode {
        self.inner.lifecycle.receive_mode()
    }

    /// Last lock expiry reported by the broker.
    ///
    /// An optimistic cache; the broker remains the authority on lock validity.
    #[must_use]
    pub fn locked_until(&self) -> DateTime<Utc> {
        self.inner.renewer.locked_until()
    }

    #[must_use]
    pub fn state(&self) -> HandleState {
        self.inner.lifecycle.state()
    }

    // Receive

    /// Receive one message, waiting up to the default receive wait.
    ///
    /// # Errors
    /// Fails if the handle is not active or the broker rejects the request.
    pub async fn receive(&self) -> Result<Option<ReceivedMessage>> {
        self.receive_with_wait(DEFAULT_RECEIVE_WAIT).await
    }

    /// Receive one message, waiting up to `max_wait`. `None` when idle.
    ///
    /// # Errors
    /// Fails if the handle is not active or the broker rejects the request.
    pub async fn receive_with_wait(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>> {
        let mut messages = self.inner.receiver.receive_batch(1, max_wait).await?;
        Ok(messages.pop())
    }

    /// Receive up to `max_messages`, waiting up to `max_wait` for the first.
    ///
    /// # Errors
    /// Fails if `max_messages` is zero, the handle is not active or the
    /// broker rejects the request.
    pub async fn receive_batch(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        self.inner.receiver.receive_batch(max_messages, max_wait).await
    }

    /// Receive a deferred message by sequence number.
    ///
    /// # Errors
    /// Returns `Error::MessageNotFound` if no deferred message has that number.
    pub async fn receive_deferred(&self, sequence_number: i64) -> Result<ReceivedMessage> {
        let mut messages = self
            .inner
            .receiver
            .receive_deferred_batch(&[sequence_number])
            .await?;
        messages.pop().ok_or_else(|| Error::MessageNotFound {
            session_id: self.session_id().to_string(),
            sequence_number,
        })
    }

    /// Receive several deferred messages by sequence number.
    ///
    /// # Errors
    /// Returns `Error::MessageNotFound` if any number is unknown; nothing is
    /// received in that case.
    pub async fn receive_deferred_batch(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>> {
        self.inner
            .receiver
            .receive_deferred_batch(sequence_numbers)
            .await
    }

    /// Browse the next message without locking it.
    ///
    /// # Errors
    /// Fails if the handle is not active or the broker rejects the request.
    pub async fn peek(&self) -> Result<Option<ReceivedMessage>> {
        let mut messages = self.inner.receiver.peek_batch(1).await?;
        Ok(messages.pop())
    }

    /// Browse up to `max_messages` from the cursor.
    ///
    /// # Errors
    /// Fails if `max_messages` is zero, the handle is not active or the
    /// broker rejects the request.
    pub async fn peek_batch(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        self.inner.receiver.peek_batch(max_messages).await
    }

    /// Browse from an explicit sequence number and move the cursor there.
    ///
    /// # Errors
    /// Fails if `max_messages` is zero, the handle is not active or the
    /// broker rejects the request.
    pub async fn peek_from(
        &self,
        from_sequence_number: i64,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>> {
        self.inner
            .receiver
            .peek_from(from_sequence_number, max_messages)
            .await
    }

    /// Receive until the session is idle for `idle_wait`.
    ///
    /// In peek-lock mode every message is completed. Returns the number of
    /// messages removed.
    ///
    /// # Errors
    /// Stops at the first failed receive or settlement.
    pub async fn drain(&self, idle_wait: Duration) -> Result<usize> {
        let mut drained = 0;
        loop {
            let messages = self.receive_batch(DRAIN_BATCH, idle_wait).await?;
            if messages.is_empty() {
                break;
            }
            for message in &messages {
                if self.receive_mode() == ReceiveMode::PeekLock {
                    self.settle(message, Disposition::Complete).await?;
                }
                drained += 1;
            }
        }
        tracing::debug!(session_id = %self.session_id(), drained, "session drained");
        Ok(drained)
    }

    // Settlement

    async fn settle(&self, message: &ReceivedMessage, disposition: Disposition) -> Result<()> {
        let target = message.lock_token.map_or(
            MessageRef::SequenceNumber(message.sequence_number),
            MessageRef::LockToken,
        );
        self.inner.settlement.settle(target, disposition).await
    }

    /// Complete a message: it is removed from the session.
    ///
    /// # Errors
    /// Returns `Error::MessageLockLost` if the lock was already released.
    pub async fn complete(&self, lock_token: LockToken) -> Result<()> {
        self.inner
            .settlement
            .settle(MessageRef::LockToken(lock_token), Disposition::Complete)
            .await
    }

    /// Abandon a message: it becomes available for redelivery.
    ///
    /// # Errors
    /// Returns `Error::MessageLockLost` if the lock was already released.
    pub async fn abandon(&self, lock_token: LockToken, properties_to_modify: Properties) -> Result<()> {
        self.inner
            .settlement
            .settle(
                MessageRef::LockToken(lock_token),
                Disposition::Abandon {
                    properties_to_modify,
                },
            )
            .await
    }

    /// Defer a message: it can then only be received by sequence number.
    ///
    /// # Errors
    /// Returns `Error::MessageLockLost` if the lock was already released.
    pub async fn defer(&self, lock_token: LockToken, properties_to_modify: Properties) -> Result<()> {
        self.inner
            .settlement
            .settle(
                MessageRef::LockToken(lock_token),
                Disposition::Defer {
                    properties_to_modify,
                },
            )
            .await
    }

    /// Move a message to the dead-letter sub-queue.
    ///
    /// # Errors
    /// Returns `Error::MessageLockLost` if the lock was already released.
    pub async fn dead_letter(&self, lock_token: LockToken, options: DeadLetterOptions) -> Result<()> {
        self.inner
            .settlement
            .settle(MessageRef::LockToken(lock_token), Disposition::DeadLetter(options))
            .await
    }

    /// Complete a locked message identified by sequence number.
    ///
    /// # Errors
    /// Returns `Error::MessageLockLost` if no locked message has that number.
    pub async fn complete_by_sequence_number(&self, sequence_number: i64) -> Result<()> {
        self.inner
            .settlement
            .settle(
                MessageRef::SequenceNumber(sequence_number),
                Disposition::Complete,
            )
            .await
    }

    /// Abandon a locked message identified by sequence number.
    ///
    /// # Errors
    /// Returns `Error::MessageLockLost` if no locked message has that number.
    pub async fn abandon_by_sequence_number(
        &self,
        sequence_number: i64,
        properties_to_modify: Properties,
    ) -> Result<()> {
        self.inner
            .settlement
            .settle(
                MessageRef::SequenceNumber(sequence_number),
                Disposition::Abandon {
                    properties_to_modify,
                },
            )
            .await
    }

    /// Defer a locked message identified by sequence number.
    ///
    /// # Errors
    /// Returns `Error::MessageLockLost` if no locked message has that number.
    pub async fn defer_by_sequence_number(
        &self,
        sequence_number: i64,
        properties_to_modify: Properties,
    ) -> Result<()> {
        self.inner
            .settlement
            .settle(
                MessageRef::SequenceNumber(sequence_number),
                Disposition::Defer {
                    properties_to_modify,
                },
            )
            .await
    }

    /// Dead-letter a locked message identified by sequence number.
    ///
    /// # Errors
    /// Returns `Error::MessageLockLost` if no locked message has that number.
    pub async fn dead_letter_by_sequence_number(
        &self,
        sequence_number: i64,
        options: DeadLetterOptions,
    ) -> Result<()> {
        self.inner
            .settlement
            .settle(
                MessageRef::SequenceNumber(sequence_number),
                Disposition::DeadLetter(options),
            )
            .await
    }

    // Locks

    /// Renew the session lock and return its new expiry.
    ///
    /// # Errors
    /// Returns `Error::SessionLockLost` if the lock is gone; the handle is
    /// then `Expired`.
    pub async fn renew_session_lock(&self) -> Result<DateTime<Utc>> {
        self.inner.renewer.renew_session_lock().await
    }

    /// Renew the lock of a received message.
    ///
    /// Message locks within a session follow the session lock, so this also
    /// extends the session lock.
    ///
    /// # Errors
    /// Returns `Error::MessageLockLost` if the message is no longer locked.
    pub async fn renew_message_lock(&self, message: &ReceivedMessage) -> Result<DateTime<Utc>> {
        self.inner.renewer.renew_message_lock(message).await
    }

    /// Keep the session lock alive in the background for up to `max_duration`.
    pub fn auto_renew(&self, max_duration: Duration) -> AutoRenewGuard {
        spawn_auto_renew(
            Arc::clone(&self.inner.lifecycle),
            Arc::clone(&self.inner.renewer),
            max_duration,
        )
    }

    // State

    /// Read the session state. `None` if never set or cleared.
    ///
    /// # Errors
    /// Fails if the handle is not active or the broker rejects the request.
    pub async fn get_state(&self) -> Result<Option<Vec<u8>>> {
        self.inner.state.get().await
    }

    /// Replace the session state; `None` clears it.
    ///
    /// # Errors
    /// Returns `Error::StateTooLarge` if the broker rejects the size.
    pub async fn set_state(&self, state: Option<&[u8]>) -> Result<()> {
        self.inner.state.set(state).await
    }

    /// Release the session lock and close the link. Idempotent.
    pub async fn close(&self) {
        self.inner.lifecycle.close().await;
    }
}

impl fmt::Debug for MessageSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSession")
            .field("session_id", &self.session_id())
            .field("entity_path", &self.entity_path())
            .field("receive_mode", &self.receive_mode())
            .field("state", &self.state())
            .field("locked_until", &self.locked_until())
            .finish()
    }
}
