//! Entity and session bookkeeping for the in-memory broker.
//!
//! Everything here is synchronous and runs under the broker's state lock.
//! Lock expiry is evaluated lazily against the `now` passed in.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use sessionbus_core::{
    LockToken, Message, MessageRef, Properties, ReceiveMode, ReceivedMessage, SessionId,
    message::{DEAD_LETTER_ERROR_DESCRIPTION, DEAD_LETTER_REASON},
    protocol::{ErrorCondition, ErrorPayload},
};

use super::EntityDescription;

pub(super) fn lock_lost(session_id: &str) -> ErrorPayload {
    ErrorPayload::new(
        ErrorCondition::SessionLockLost,
        format!("session {session_id} is not locked by this link"),
    )
    .in_session(session_id)
}

pub(super) fn message_lock_lost(session_id: &str, target: MessageRef) -> ErrorPayload {
    ErrorPayload::new(
        ErrorCondition::MessageLockLost,
        format!("message {target} is not locked in session {session_id}"),
    )
    .in_session(session_id)
    .for_target(target)
}

fn message_not_found(session_id: &str, sequence_number: i64) -> ErrorPayload {
    ErrorPayload::new(
        ErrorCondition::MessageNotFound,
        format!("no deferred message {sequence_number} in session {session_id}"),
    )
    .in_session(session_id)
    .for_target(MessageRef::SequenceNumber(sequence_number))
}

/// A message as the broker holds it.
#[derive(Debug, Clone)]
pub(super) struct StoredMessage {
    pub(super) message: Message,
    pub(super) sequence_number: i64,
    pub(super) enqueued_at: DateTime<Utc>,
    /// Scheduled messages stay invisible until this instant.
    pub(super) visible_at: DateTime<Utc>,
    pub(super) expires_at: Option<DateTime<Utc>>,
    pub(super) delivery_count: u32,
    /// Once deferred, only reachable by sequence number until settled.
    pub(super) deferred: bool,
}

impl StoredMessage {
    pub(super) fn new(
        message: Message,
        sequence_number: i64,
        now: DateTime<Utc>,
        visible_at: DateTime<Utc>,
    ) -> Self {
        let expires_at = message
            .time_to_live
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| visible_at.checked_add_signed(ttl));
        Self {
            message,
            sequence_number,
            enqueued_at: now,
            visible_at,
            expires_at,
            delivery_count: 0,
            deferred: false,
        }
    }

    fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now && !self.is_expired(now)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn modify_properties(&mut self, properties: Properties) {
        self.message.properties.extend(properties);
    }

    pub(super) fn mark_dead_lettered(&mut self, reason: Option<String>, description: Option<String>) {
        if let Some(reason) = reason {
            self.message
                .properties
                .insert(DEAD_LETTER_REASON.to_string(), reason.into());
        }
        if let Some(description) = description {
            self.message
                .properties
                .insert(DEAD_LETTER_ERROR_DESCRIPTION.to_string(), description.into());
        }
    }

    pub(super) fn to_received(
        &self,
        session_id: &str,
        lock_token: Option<LockToken>,
        locked_until: Option<DateTime<Utc>>,
    ) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message.message_id.clone(),
            session_id: session_id.to_string(),
            sequence_number: self.sequence_number,
            lock_token,
            delivery_count: self.delivery_count,
            enqueued_at: self.enqueued_at,
            locked_until,
            correlation_id: self.message.correlation_id.clone(),
            label: self.message.label.clone(),
            body: self.message.body.clone(),
            properties: self.message.properties.clone(),
        }
    }
}

/// Lock held on a session by one link.
#[derive(Debug, Clone)]
pub(super) struct SessionLock {
    pub(super) owner: u64,
    pub(super) receive_mode: ReceiveMode,
    pub(super) locked_until: DateTime<Utc>,
}

/// One session of an entity.
#[derive(Debug, Default)]
pub(super) struct SessionEntry {
    available: BTreeMap<i64, StoredMessage>,
    deferred: BTreeMap<i64, StoredMessage>,
    locked: HashMap<LockToken, StoredMessage>,
    pub(super) state: Option<Vec<u8>>,
    pub(super) lock: Option<SessionLock>,
}

impl SessionEntry {
    /// Drop a lapsed lock. Returns `true` if one was released.
    pub(super) fn expire_lock_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.lock.as_ref().is_some_and(|lock| lock.locked_until <= now) {
            self.release_lock();
            return true;
        }
        false
    }

    /// Drop the lock; locked messages go back where they were delivered from.
    pub(super) fn release_lock(&mut self) {
        self.lock = None;
        let released: Vec<StoredMessage> = self.locked.drain().map(|(_, m)| m).collect();
        for stored in released {
            self.put_back(stored);
        }
    }

    pub(super) fn is_owned_by(&self, owner: u64) -> bool {
        self.lock.as_ref().is_some_and(|lock| lock.owner == owner)
    }

    fn has_visible(&self, now: DateTime<Utc>) -> bool {
        self.available.values().any(|m| m.is_visible(now))
    }

    /// Earliest instant a scheduled message becomes visible.
    pub(super) fn next_visible_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.available
            .values()
            .filter(|m| m.visible_at > now)
            .map(|m| m.visible_at)
            .min()
    }

    pub(super) fn message_count(&self) -> usize {
        self.available.len() + self.deferred.len() + self.locked.len()
    }

    fn enqueue(&mut self, stored: StoredMessage) {
        self.available.insert(stored.sequence_number, stored);
    }

    fn put_back(&mut self, stored: StoredMessage) {
        if stored.deferred {
            self.deferred.insert(stored.sequence_number, stored);
        } else {
            self.enqueue(stored);
        }
    }

    /// Deliver up to `max` visible messages in sequence order.
    ///
    /// Messages past their time to live are dropped; messages past the
    /// delivery limit go to `dead_letter` instead of the caller.
    pub(super) fn deliver(
        &mut self,
        session_id: &str,
        max: usize,
        now: DateTime<Utc>,
        max_delivery_count: u32,
        dead_letter: &mut Vec<StoredMessage>,
    ) -> Vec<ReceivedMessage> {
        let Some((receive_mode, locked_until)) = self
            .lock
            .as_ref()
            .map(|lock| (lock.receive_mode, lock.locked_until))
        else {
            return Vec::new();
        };

        let mut delivered = Vec::new();
        while delivered.len() < max {
            let Some(sequence_number) = self
                .available
                .values()
                .find(|m| m.visible_at <= now)
                .map(|m| m.sequence_number)
            else {
                break;
            };
            let Some(mut stored) = self.available.remove(&sequence_number) else {
                break;
            };
            if stored.is_expired(now) {
                continue;
            }

            stored.delivery_count += 1;
            if stored.delivery_count > max_delivery_count {
                stored.mark_dead_lettered(
                    Some("MaxDeliveryCountExceeded".to_string()),
                    Some(format!("delivered more than {max_delivery_count} times")),
                );
                dead_letter.push(stored);
                continue;
            }
            delivered.push(self.hand_out(session_id, stored, receive_mode, locked_until));
        }
        delivered
    }

    /// Deliver deferred messages by sequence number. All or nothing.
    pub(super) fn deliver_deferred(
        &mut self,
        session_id: &str,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>, ErrorPayload> {
        let Some((receive_mode, locked_until)) = self
            .lock
            .as_ref()
            .map(|lock| (lock.receive_mode, lock.locked_until))
        else {
            return Err(lock_lost(session_id));
        };
        if let Some(missing) = sequence_numbers
            .iter()
            .find(|seq| !self.deferred.contains_key(seq))
        {
            return Err(message_not_found(session_id, *missing));
        }

        let mut delivered = Vec::with_capacity(sequence_numbers.len());
        for sequence_number in sequence_numbers {
            if let Some(mut stored) = self.deferred.remove(sequence_number) {
                stored.delivery_count += 1;
                delivered.push(self.hand_out(session_id, stored, receive_mode, locked_until));
            }
        }
        Ok(delivered)
    }

    fn hand_out(
        &mut self,
        session_id: &str,
        stored: StoredMessage,
        receive_mode: ReceiveMode,
        locked_until: DateTime<Utc>,
    ) -> ReceivedMessage {
        match receive_mode {
            ReceiveMode::ReceiveAndDelete => stored.to_received(session_id, None, None),
            ReceiveMode::PeekLock => {
                let lock_token = LockToken::new();
                let received = stored.to_received(session_id, Some(lock_token), Some(locked_until));
                self.locked.insert(lock_token, stored);
                received
            }
        }
    }

    /// Browse without locking: visible, deferred and locked messages.
    pub(super) fn peek(
        &self,
        session_id: &str,
        from_sequence_number: i64,
        max: usize,
        now: DateTime<Utc>,
    ) -> Vec<ReceivedMessage> {
        let mut browsable: Vec<&StoredMessage> = self
            .available
            .values()
            .filter(|m| m.is_visible(now))
            .chain(self.deferred.values())
            .chain(self.locked.values())
            .filter(|m| m.sequence_number >= from_sequence_number)
            .collect();
        browsable.sort_by_key(|m| m.sequence_number);
        browsable
            .into_iter()
            .take(max)
            .map(|m| m.to_received(session_id, None, None))
            .collect()
    }

    /// Remove a locked message for settlement.
    pub(super) fn take_locked(&mut self, target: MessageRef) -> Option<StoredMessage> {
        let lock_token = match target {
            MessageRef::LockToken(lock_token) => lock_token,
            MessageRef::SequenceNumber(sequence_number) => *self
                .locked
                .iter()
                .find(|(_, m)| m.sequence_number == sequence_number)
                .map(|(token, _)| token)?,
        };
        self.locked.remove(&lock_token)
    }

    pub(super) fn locks_message(&self, lock_token: &LockToken) -> bool {
        self.locked.contains_key(lock_token)
    }

    pub(super) fn abandon(&mut self, mut stored: StoredMessage, properties: Properties) {
        stored.modify_properties(properties);
        self.put_back(stored);
    }

    pub(super) fn defer(&mut self, mut stored: StoredMessage, properties: Properties) {
        stored.modify_properties(properties);
        stored.deferred = true;
        self.deferred.insert(stored.sequence_number, stored);
    }

    /// Remove a scheduled message that is not yet visible.
    fn cancel_scheduled(&mut self, sequence_number: i64, now: DateTime<Utc>) -> bool {
        if self
            .available
            .get(&sequence_number)
            .is_some_and(|m| m.visible_at > now)
        {
            self.available.remove(&sequence_number);
            return true;
        }
        false
    }
}

/// A queue, topic or subscription.
#[derive(Debug)]
pub(super) struct Entity {
    pub(super) description: EntityDescription,
    next_sequence_number: i64,
    pub(super) sessions: BTreeMap<SessionId, SessionEntry>,
    pub(super) dead_letter: Vec<StoredMessage>,
}

impl Entity {
    pub(super) const fn new(description: EntityDescription) -> Self {
        Self {
            description,
            next_sequence_number: 0,
            sessions: BTreeMap::new(),
            dead_letter: Vec::new(),
        }
    }

    pub(super) const fn allocate_sequence_number(&mut self) -> i64 {
        self.next_sequence_number += 1;
        self.next_sequence_number
    }

    /// Store a message in its session. Messages without a session id land in
    /// the unnamed session.
    pub(super) fn enqueue(&mut self, stored: StoredMessage) {
        let session_id = stored.message.session_id.clone().unwrap_or_default();
        self.sessions.entry(session_id).or_default().enqueue(stored);
    }

    pub(super) fn cancel_scheduled(&mut self, sequence_number: i64, now: DateTime<Utc>) -> bool {
        self.sessions
            .values_mut()
            .any(|entry| entry.cancel_scheduled(sequence_number, now))
    }

    /// First unlocked session with a deliverable message.
    pub(super) fn session_with_available(&mut self, now: DateTime<Utc>) -> Option<SessionId> {
        self.sessions.iter_mut().find_map(|(session_id, entry)| {
            entry.expire_lock_if_due(now);
            (entry.lock.is_none() && entry.has_visible(now)).then(|| session_id.clone())
        })
    }

    /// Earliest instant at which an accept-any could newly succeed.
    pub(super) fn next_wake(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.sessions
            .values()
            .filter_map(|entry| match &entry.lock {
                Some(lock) if entry.has_visible(now) => Some(lock.locked_until),
                _ => entry.next_visible_at(now),
            })
            .min()
    }

    /// Session locked by `owner`, with the dead-letter queue alongside.
    pub(super) fn owned_session(
        &mut self,
        session_id: &str,
        owner: u64,
        now: DateTime<Utc>,
    ) -> Result<(&mut SessionEntry, &mut Vec<StoredMessage>), ErrorPayload> {
        let Self {
            sessions,
            dead_letter,
            ..
        } = self;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| lock_lost(session_id))?;
        entry.expire_lock_if_due(now);
        if !entry.is_owned_by(owner) {
            return Err(lock_lost(session_id));
        }
        Ok((entry, dead_letter))
    }

    /// Release every lock held by `owner`. Returns how many were released.
    pub(super) fn release_owner(&mut self, owner: u64) -> usize {
        let mut released = 0;
        for entry in self.sessions.values_mut() {
            if entry.is_owned_by(owner) {
                entry.release_lock();
                released += 1;
            }
        }
        released
    }

    pub(super) fn message_count(&self) -> usize {
        self.sessions.values().map(SessionEntry::message_count).sum()
    }
}
