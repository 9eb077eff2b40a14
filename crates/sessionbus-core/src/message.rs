//! Message and session model.

use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::base64_bytes;

/// Session identifier, unique per entity while locked.
pub type SessionId = String;

/// Application properties carried by a message.
pub type Properties = HashMap<String, Value>;

/// Property set on dead-lettered messages.
pub const DEAD_LETTER_REASON: &str = "DeadLetterReason";
/// Property set on dead-lettered messages.
pub const DEAD_LETTER_ERROR_DESCRIPTION: &str = "DeadLetterErrorDescription";

/// How delivered messages are finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Delivery removes the message; there is no settlement step.
    ReceiveAndDelete,
    /// Delivery locks the message until it is settled or the lock lapses.
    PeekLock,
}

/// Lifecycle state of a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    /// Session lock held; all operations permitted.
    Active,
    /// Closed by the caller.
    Closed,
    /// Session lock lost or lapsed.
    Expired,
}

impl HandleState {
    /// Whether no further operation can succeed in this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Opaque token correlating a settlement with one delivered message instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Generate a fresh lock token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Message published to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Application message id.
    pub message_id: String,
    /// Session the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Optional correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Optional label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Time to live after enqueue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<Duration>,
    /// Payload (base64 on the wire).
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Application properties.
    #[serde(default)]
    pub properties: Properties,
}

impl Message {
    /// Create a message with a random id.
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            session_id: None,
            correlation_id: None,
            label: None,
            time_to_live: None,
            body: body.into(),
            properties: Properties::new(),
        }
    }

    /// Set the message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Set the session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the time to live.
    #[must_use]
    pub const fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Set an application property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Message delivered from a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    /// Application message id.
    pub message_id: String,
    /// Session the message was delivered from.
    pub session_id: SessionId,
    /// Broker-assigned sequence number.
    pub sequence_number: i64,
    /// Lock token; `None` for receive-and-delete deliveries and peeked messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<LockToken>,
    /// Number of deliveries including this one.
    pub delivery_count: u32,
    /// When the broker accepted the message.
    pub enqueued_at: DateTime<Utc>,
    /// Lock expiry, when locked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    /// Optional correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Optional label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Payload.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Application properties.
    #[serde(default)]
    pub properties: Properties,
}

impl ReceivedMessage {
    /// Get a property by key.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// Dead-letter parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub properties_to_modify: Properties,
}

impl DeadLetterOptions {
    /// Dead-letter with a reason and description.
    #[must_use]
    pub fn new(reason: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            description: Some(description.into()),
            properties_to_modify: Properties::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder() {
        let msg = Message::new("hello")
            .with_message_id("m-1")
            .with_session_id("s-1")
            .with_property("attempt", 3);

        assert_eq!(msg.message_id, "m-1");
        assert_eq!(msg.session_id.as_deref(), Some("s-1"));
        assert_eq!(msg.body, b"hello");
        assert_eq!(msg.properties["attempt"], 3);
    }

    #[test]
    fn test_body_is_base64_on_the_wire() {
        let msg = Message::new(vec![0u8, 159, 146, 150]).with_message_id("bin");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["body"], "AJ+Slg==");

        let parsed: Message = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.body, vec![0u8, 159, 146, 150]);
    }

    #[test]
    fn test_lock_tokens_are_unique() {
        assert_ne!(LockToken::new(), LockToken::new());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!HandleState::Active.is_terminal());
        assert!(HandleState::Closed.is_terminal());
        assert!(HandleState::Expired.is_terminal());
        assert_eq!(HandleState::Expired.to_string(), "expired");
    }
}
