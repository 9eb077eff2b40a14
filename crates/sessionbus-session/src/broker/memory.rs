//! In-memory broker.
//!
//! Implements the link transport, entity management and sending for a single
//! process. Useful for development and tests; all data is lost on drop.
//!
//! Time comes from the Tokio clock anchored at a wall-clock origin, so tests
//! running with a paused clock observe lock expiry deterministically.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sessionbus_core::{
    ClientSettings, Error, Link, LinkFactory, LinkSender, Message, MessageRef, ReceiveMode,
    ReceivedMessage, Result, SessionId,
    protocol::{
        Disposition, ErrorCondition, ErrorPayload, RequestBody, RequestFrame, ResponseBody,
        ResponseFrame,
    },
};
use tokio::{
    sync::{Notify, mpsc},
    time::Instant,
};

use super::{
    BrokerConfig, EntityDescription, EntityKind, Fault,
    entity::{Entity, SessionEntry, SessionLock, StoredMessage, message_lock_lost},
};

type Outcome = std::result::Result<ResponseBody, ErrorPayload>;

fn entity_not_found(path: &str) -> ErrorPayload {
    ErrorPayload::new(ErrorCondition::EntityNotFound, path)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Broker clock: wall-clock origin plus elapsed Tokio time.
struct BrokerClock {
    origin_wall: DateTime<Utc>,
    origin: Instant,
}

impl BrokerClock {
    fn new() -> Self {
        Self {
            origin_wall: Utc::now(),
            origin: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.origin_wall + to_chrono(self.origin.elapsed())
    }

    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        self.origin + (at - self.origin_wall).to_std().unwrap_or_default()
    }
}

#[derive(Default)]
struct BrokerState {
    entities: HashMap<String, Entity>,
    open_links: HashSet<u64>,
    faults: VecDeque<Fault>,
}

struct BrokerInner {
    config: BrokerConfig,
    clock: BrokerClock,
    state: Mutex<BrokerState>,
    /// Signalled whenever a session may have become acceptable or receivable.
    changed: Notify,
    next_link_id: AtomicU64,
}

/// In-memory broker.
///
/// Cheap to clone; clones share the same entities.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create a broker with default limits. Must be called within a Tokio
    /// runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a broker with explicit limits.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                clock: BrokerClock::new(),
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
                next_link_id: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Current broker time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // Entity management

    /// Provision an entity.
    ///
    /// # Errors
    /// Fails if the path is taken, or a subscription's topic does not exist.
    pub fn create_entity(&self, description: EntityDescription) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.entities.contains_key(&description.path) {
            return Err(Error::InvalidOperation(format!(
                "entity {} already exists",
                description.path
            )));
        }
        if let EntityKind::Subscription { topic } = &description.kind {
            let is_topic = state
                .entities
                .get(topic)
                .is_some_and(|e| e.description.kind == EntityKind::Topic);
            if !is_topic {
                return Err(Error::EntityNotFound(topic.clone()));
            }
        }
        tracing::debug!(path = %description.path, kind = ?description.kind, "entity created");
        state
            .entities
            .insert(description.path.clone(), Entity::new(description));
        Ok(())
    }

    /// Delete an entity; deleting a topic deletes its subscriptions.
    ///
    /// # Errors
    /// Returns `Error::EntityNotFound` if no such entity exists.
    pub fn delete_entity(&self, path: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.entities.remove(path).is_none() {
                return Err(Error::EntityNotFound(path.to_string()));
            }
            state.entities.retain(|_, entity| {
                !matches!(&entity.description.kind, EntityKind::Subscription { topic } if topic == path)
            });
        }
        tracing::debug!(path, "entity deleted");
        self.inner.changed.notify_waiters();
        Ok(())
    }

    /// Whether an entity exists.
    #[must_use]
    pub fn entity_exists(&self, path: &str) -> bool {
        self.inner.state.lock().entities.contains_key(path)
    }

    // Sending

    /// Send a message. Sending to a topic fans out to its subscriptions.
    ///
    /// Returns the sequence number assigned by the entity sent to.
    ///
    /// # Errors
    /// Fails if the entity does not exist, or requires sessions and the
    /// message has no session id.
    pub fn send(&self, path: &str, message: Message) -> Result<i64> {
        self.enqueue(path, message, None)
    }

    /// Send a message that becomes visible at `enqueue_at`.
    ///
    /// # Errors
    /// See [`Self::send`].
    pub fn schedule_message(
        &self,
        path: &str,
        message: Message,
        enqueue_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.enqueue(path, message, Some(enqueue_at))
    }

    /// Cancel a scheduled message that is not yet visible.
    ///
    /// # Errors
    /// Returns `Error::MessageNotFound` if nothing is scheduled under that
    /// sequence number.
    pub fn cancel_scheduled_message(&self, path: &str, sequence_number: i64) -> Result<()> {
        let now = self.now();
        let mut state = self.inner.state.lock();
        let targets = Self::delivery_targets(&state, path)?;
        let mut cancelled = false;
        for target in &targets {
            if let Some(entity) = state.entities.get_mut(target) {
                cancelled |= entity.cancel_scheduled(sequence_number, now);
            }
        }
        if cancelled {
            Ok(())
        } else {
            Err(Error::MessageNotFound {
                session_id: SessionId::new(),
                sequence_number,
            })
        }
    }

    fn enqueue(
        &self,
        path: &str,
        message: Message,
        enqueue_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let now = self.now();
        let sequence_number = {
            let mut state = self.inner.state.lock();
            let targets = Self::delivery_targets(&state, path)?;
            if message.session_id.is_none() {
                let needs_session = targets.iter().find(|target| {
                    state
                        .entities
                        .get(*target)
                        .is_some_and(|e| e.description.requires_session)
                });
                if let Some(target) = needs_session {
                    return Err(Error::InvalidOperation(format!(
                        "entity {target} requires a session id on every message"
                    )));
                }
            }

            let source = state
                .entities
                .get_mut(path)
                .ok_or_else(|| Error::EntityNotFound(path.to_string()))?;
            let sequence_number = source.allocate_sequence_number();

            for target in &targets {
                let Some(entity) = state.entities.get_mut(target) else {
                    continue;
                };
                entity.enqueue(StoredMessage::new(
                    message.clone(),
                    sequence_number,
                    now,
                    enqueue_at.unwrap_or(now).max(now),
                ));
            }
            sequence_number
        };

        tracing::trace!(
            path,
            sequence_number,
            session_id = message.session_id.as_deref().unwrap_or_default(),
            "message enqueued"
        );
        self.inner.changed.notify_waiters();
        Ok(sequence_number)
    }

    /// Entities a message sent to `path` lands in.
    fn delivery_targets(state: &BrokerState, path: &str) -> Result<Vec<String>> {
        let entity = state
            .entities
            .get(path)
            .ok_or_else(|| Error::EntityNotFound(path.to_string()))?;
        match &entity.description.kind {
            EntityKind::Topic => Ok(state
                .entities
                .values()
                .filter(|e| {
                    matches!(&e.description.kind, EntityKind::Subscription { topic } if topic == path)
                })
                .map(|e| e.description.path.clone())
                .collect()),
            _ => Ok(vec![path.to_string()]),
        }
    }

    // Test hooks

    /// Make the next request received by any link fail with `fault`.
    pub fn inject_fault(&self, fault: Fault) {
        self.inner.state.lock().faults.push_back(fault);
    }

    /// Expire a session lock now, as if it lapsed or was taken over.
    ///
    /// Returns `false` if the session was not locked.
    pub fn expire_session_lock(&self, path: &str, session_id: &str) -> bool {
        let expired = {
            let mut state = self.inner.state.lock();
            state
                .entities
                .get_mut(path)
                .and_then(|entity| entity.sessions.get_mut(session_id))
                .is_some_and(|entry| {
                    let locked = entry.lock.is_some();
                    entry.release_lock();
                    locked
                })
        };
        if expired {
            tracing::debug!(path, session_id, "session lock expired by test hook");
            self.inner.changed.notify_waiters();
        }
        expired
    }

    /// Whether a session currently holds a valid lock.
    #[must_use]
    pub fn is_session_locked(&self, path: &str, session_id: &str) -> bool {
        let now = self.now();
        let mut state = self.inner.state.lock();
        state
            .entities
            .get_mut(path)
            .and_then(|entity| entity.sessions.get_mut(session_id))
            .is_some_and(|entry| {
                entry.expire_lock_if_due(now);
                entry.lock.is_some()
            })
    }

    /// Messages in the entity's dead-letter sub-queue.
    ///
    /// # Errors
    /// Returns `Error::EntityNotFound` if no such entity exists.
    pub fn dead_letter_messages(&self, path: &str) -> Result<Vec<ReceivedMessage>> {
        let state = self.inner.state.lock();
        let entity = state
            .entities
            .get(path)
            .ok_or_else(|| Error::EntityNotFound(path.to_string()))?;
        Ok(entity
            .dead_letter
            .iter()
            .map(|stored| {
                let session_id = stored.message.session_id.clone().unwrap_or_default();
                stored.to_received(&session_id, None, None)
            })
            .collect())
    }

    /// Messages held by the entity: available, scheduled, deferred or locked.
    ///
    /// # Errors
    /// Returns `Error::EntityNotFound` if no such entity exists.
    pub fn active_message_count(&self, path: &str) -> Result<usize> {
        let state = self.inner.state.lock();
        state
            .entities
            .get(path)
            .map(Entity::message_count)
            .ok_or_else(|| Error::EntityNotFound(path.to_string()))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkFactory for InMemoryBroker {
    async fn open_link(&self, entity_path: &str, settings: &ClientSettings) -> Result<Link> {
        let token = settings.token_provider.get_token(entity_path).await?;
        if token.token.is_empty() {
            return Err(Error::Unauthorized(format!(
                "empty token presented for {entity_path}"
            )));
        }

        let link_id = self.inner.next_link_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.state.lock();
            let entity = state
                .entities
                .get(entity_path)
                .ok_or_else(|| Error::EntityNotFound(entity_path.to_string()))?;
            if entity.description.kind == EntityKind::Topic {
                return Err(Error::InvalidOperation(format!(
                    "cannot receive from topic {entity_path}; use a subscription"
                )));
            }
            if !entity.description.requires_session {
                return Err(Error::InvalidOperation(format!(
                    "entity {entity_path} does not require sessions"
                )));
            }
            state.open_links.insert(link_id);
        }

        tracing::debug!(entity_path, link_id, "broker link opened");
        let (outbound, inbound) = mpsc::unbounded_channel();
        Ok(Link {
            sender: Box::new(MemoryLinkSender {
                broker: Arc::clone(&self.inner),
                link_id,
                entity_path: entity_path.to_string(),
                outbound,
                closed: AtomicBool::new(false),
            }),
            inbound,
        })
    }
}

/// Link endpoint on the broker side.
struct MemoryLinkSender {
    broker: Arc<BrokerInner>,
    link_id: u64,
    entity_path: String,
    outbound: mpsc::UnboundedSender<ResponseFrame>,
    closed: AtomicBool,
}

impl MemoryLinkSender {
    fn shut_down(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.release_link(self.link_id);
        }
    }
}

#[async_trait]
impl LinkSender for MemoryLinkSender {
    async fn send(&self, frame: RequestFrame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Communication(format!(
                "link {} to {} is closed",
                self.link_id, self.entity_path
            )));
        }

        let fault = self.broker.state.lock().faults.pop_front();
        let mut delay = None;
        match fault {
            Some(Fault::ServerBusy) => {
                tracing::debug!(link_id = self.link_id, "injecting server-busy fault");
                let error = ErrorPayload::new(ErrorCondition::ServerBusy, "server busy");
                let _ = self
                    .outbound
                    .send(ResponseFrame::from_outcome(frame.correlation_id, Err(error)));
                return Ok(());
            }
            Some(Fault::DropResponse) => {
                tracing::debug!(link_id = self.link_id, "dropping request");
                return Ok(());
            }
            Some(Fault::DelayResponse(by)) => {
                tracing::debug!(link_id = self.link_id, delay = ?by, "delaying response");
                delay = Some(by);
            }
            None => {}
        }

        let broker = Arc::clone(&self.broker);
        let link_id = self.link_id;
        let entity_path = self.entity_path.clone();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let outcome = broker.handle(link_id, &entity_path, frame.body).await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            // The client may have gone away; its link release cleans up.
            let _ = outbound.send(ResponseFrame::from_outcome(frame.correlation_id, outcome));
        });
        Ok(())
    }

    async fn close(&self) {
        self.shut_down();
    }
}

impl Drop for MemoryLinkSender {
    fn drop(&mut self) {
        self.shut_down();
    }
}

impl BrokerInner {
    fn release_link(&self, link_id: u64) {
        let released: usize = {
            let mut state = self.state.lock();
            state.open_links.remove(&link_id);
            state
                .entities
                .values_mut()
                .map(|entity| entity.release_owner(link_id))
                .sum()
        };
        tracing::debug!(link_id, released, "broker link closed");
        if released > 0 {
            self.changed.notify_waiters();
        }
    }

    fn lock_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.config.lock_duration)
    }

    async fn handle(&self, link_id: u64, path: &str, body: RequestBody) -> Outcome {
        match body {
            RequestBody::AcceptSession {
                session_id,
                receive_mode,
                server_timeout_ms,
            } => {
                self.accept(
                    link_id,
                    path,
                    session_id,
                    receive_mode,
                    Duration::from_millis(server_timeout_ms),
                )
                .await
            }
            RequestBody::RenewSessionLock { session_id } => {
                self.with_owned(link_id, path, &session_id, |entry, _, now| {
                    let locked_until = self.renew(entry.lock.as_mut(), now);
                    Ok(ResponseBody::LockRenewed { locked_until })
                })
            }
            RequestBody::RenewMessageLock {
                session_id,
                lock_tokens,
            } => self.with_owned(link_id, path, &session_id, |entry, _, now| {
                if let Some(lost) = lock_tokens.iter().find(|t| !entry.locks_message(t)) {
                    return Err(message_lock_lost(
                        &session_id,
                        MessageRef::LockToken(*lost),
                    ));
                }
                let locked_until = self.renew(entry.lock.as_mut(), now);
                Ok(ResponseBody::LockRenewed { locked_until })
            }),
            RequestBody::Receive {
                session_id,
                max_messages,
                max_wait_ms,
            } => {
                self.receive(
                    link_id,
                    path,
                    &session_id,
                    usize::try_from(max_messages).unwrap_or(usize::MAX),
                    Duration::from_millis(max_wait_ms),
                )
                .await
            }
            RequestBody::ReceiveBySequenceNumbers {
                session_id,
                sequence_numbers,
            } => self.with_owned(link_id, path, &session_id, |entry, _, _| {
                let messages = entry.deliver_deferred(&session_id, &sequence_numbers)?;
                Ok(ResponseBody::Messages { messages })
            }),
            RequestBody::Peek {
                session_id,
                from_sequence_number,
                max_messages,
            } => self.with_owned(link_id, path, &session_id, |entry, _, now| {
                let max = usize::try_from(max_messages).unwrap_or(usize::MAX);
                let messages = entry.peek(&session_id, from_sequence_number, max, now);
                Ok(ResponseBody::Messages { messages })
            }),
            RequestBody::Settle {
                session_id,
                target,
                disposition,
            } => {
                let outcome = self.with_owned(link_id, path, &session_id, |entry, dead_letter, _| {
                    if entry
                        .lock
                        .as_ref()
                        .is_some_and(|lock| lock.receive_mode == ReceiveMode::ReceiveAndDelete)
                    {
                        return Err(ErrorPayload::new(
                            ErrorCondition::InvalidOperation,
                            "settlement is not supported in receive-and-delete mode",
                        ));
                    }
                    let stored = entry
                        .take_locked(target)
                        .ok_or_else(|| message_lock_lost(&session_id, target))?;
                    match disposition {
                        Disposition::Complete => {}
                        Disposition::Abandon {
                            properties_to_modify,
                        } => entry.abandon(stored, properties_to_modify),
                        Disposition::Defer {
                            properties_to_modify,
                        } => entry.defer(stored, properties_to_modify),
                        Disposition::DeadLetter(options) => {
                            let mut stored = stored;
                            stored.message.properties.extend(options.properties_to_modify);
                            stored.mark_dead_lettered(options.reason, options.description);
                            dead_letter.push(stored);
                        }
                    }
                    Ok(ResponseBody::Ack)
                });
                if outcome.is_ok() {
                    self.changed.notify_waiters();
                }
                outcome
            }
            RequestBody::GetSessionState { session_id } => {
                self.with_owned(link_id, path, &session_id, |entry, _, _| {
                    Ok(ResponseBody::SessionState {
                        state: entry.state.clone(),
                    })
                })
            }
            RequestBody::SetSessionState { session_id, state } => {
                let max = self.config.max_state_bytes;
                self.with_owned(link_id, path, &session_id, |entry, _, _| {
                    let size = state.as_ref().map_or(0, Vec::len);
                    if size > max {
                        return Err(ErrorPayload::new(
                            ErrorCondition::StateTooLarge,
                            format!("session state of {size} bytes exceeds {max}"),
                        )
                        .in_session(session_id.as_str())
                        .with_size(size, max));
                    }
                    entry.state = state;
                    Ok(ResponseBody::Ack)
                })
            }
            RequestBody::CloseSession { session_id } => {
                self.close_session(link_id, path, &session_id);
                Ok(ResponseBody::Ack)
            }
        }
    }

    /// Extend a lock. Each renewal is strictly later than the previous one.
    fn renew(&self, lock: Option<&mut SessionLock>, now: DateTime<Utc>) -> DateTime<Utc> {
        let proposed = self.lock_until(now);
        match lock {
            Some(lock) => {
                let floor = lock.locked_until + chrono::Duration::milliseconds(1);
                lock.locked_until = proposed.max(floor);
                lock.locked_until
            }
            None => proposed,
        }
    }

    /// Run `f` on a session locked by `link_id`.
    fn with_owned<T>(
        &self,
        link_id: u64,
        path: &str,
        session_id: &str,
        f: impl FnOnce(
            &mut SessionEntry,
            &mut Vec<StoredMessage>,
            DateTime<Utc>,
        ) -> std::result::Result<T, ErrorPayload>,
    ) -> std::result::Result<T, ErrorPayload> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let entity = state
            .entities
            .get_mut(path)
            .ok_or_else(|| entity_not_found(path))?;
        let (entry, dead_letter) = entity.owned_session(session_id, link_id, now)?;
        f(entry, dead_letter, now)
    }

    fn close_session(&self, link_id: u64, path: &str, session_id: &str) {
        let released = {
            let mut state = self.state.lock();
            state
                .entities
                .get_mut(path)
                .and_then(|entity| entity.sessions.get_mut(session_id))
                .is_some_and(|entry| {
                    let owned = entry.is_owned_by(link_id);
                    if owned {
                        entry.release_lock();
                    }
                    owned
                })
        };
        if released {
            tracing::debug!(path, session_id, link_id, "session lock released");
            self.changed.notify_waiters();
        }
    }

    /// Grant a session lock to `link_id`.
    ///
    /// A named session is granted or refused at once. Any-session requests
    /// wait up to `wait` for a session with a deliverable message.
    async fn accept(
        &self,
        link_id: u64,
        path: &str,
        requested: Option<SessionId>,
        receive_mode: ReceiveMode,
        wait: Duration,
    ) -> Outcome {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let now = self.clock.now();
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if !state.open_links.contains(&link_id) {
                    return Err(ErrorPayload::new(
                        ErrorCondition::Internal,
                        format!("link {link_id} closed before a session was granted"),
                    ));
                }
                let entity = state
                    .entities
                    .get_mut(path)
                    .ok_or_else(|| entity_not_found(path))?;

                let candidate = match &requested {
                    Some(session_id) => Some(session_id.clone()),
                    None => entity.session_with_available(now),
                };
                if let Some(session_id) = candidate {
                    let entry = entity.sessions.entry(session_id.clone()).or_default();
                    entry.expire_lock_if_due(now);
                    if entry.lock.is_some() {
                        return Err(ErrorPayload::new(
                            ErrorCondition::SessionCannotBeLocked,
                            format!("session {session_id} is locked by another client"),
                        )
                        .in_session(session_id));
                    }
                    let locked_until = self.lock_until(now);
                    entry.lock = Some(SessionLock {
                        owner: link_id,
                        receive_mode,
                        locked_until,
                    });
                    tracing::debug!(path, %session_id, link_id, "session lock granted");
                    return Ok(ResponseBody::SessionAccepted {
                        session_id,
                        locked_until,
                    });
                }
                entity.next_wake(now)
            };

            if Instant::now() >= deadline {
                return Err(ErrorPayload::new(
                    ErrorCondition::Timeout,
                    format!("no session available on {path} within {wait:?}"),
                ));
            }
            let wake_at = next_wake.map_or(deadline, |at| self.clock.instant_at(at).min(deadline));
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Deliver up to `max` messages, waiting up to `wait` for the first.
    async fn receive(
        &self,
        link_id: u64,
        path: &str,
        session_id: &str,
        max: usize,
        wait: Duration,
    ) -> Outcome {
        let deadline = Instant::now() + wait;
        let max_delivery_count = self.config.max_delivery_count;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (messages, next_wake) =
                self.with_owned(link_id, path, session_id, |entry, dead_letter, now| {
                    let messages =
                        entry.deliver(session_id, max, now, max_delivery_count, dead_letter);
                    let lock_expiry = entry.lock.as_ref().map(|lock| lock.locked_until);
                    let next_wake = match (entry.next_visible_at(now), lock_expiry) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    Ok((messages, next_wake))
                })?;

            if !messages.is_empty() || Instant::now() >= deadline {
                return Ok(ResponseBody::Messages { messages });
            }
            let wake_at = next_wake.map_or(deadline, |at| self.clock.instant_at(at).min(deadline));
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}
