//! Typed request/response frames exchanged over a session link.
//!
//! Every request carries a correlation id; the matching response echoes it.
//! A response carries either a `result` or an `error`, never both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, MessageRef},
    message::{DeadLetterOptions, LockToken, Properties, ReceiveMode, ReceivedMessage, SessionId},
};

/// Request sent to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub correlation_id: u64,
    pub body: RequestBody,
}

/// Request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    /// Lock a named session, or any session with available messages.
    AcceptSession {
        session_id: Option<SessionId>,
        receive_mode: ReceiveMode,
        server_timeout_ms: u64,
    },
    RenewSessionLock {
        session_id: SessionId,
    },
    RenewMessageLock {
        session_id: SessionId,
        lock_tokens: Vec<LockToken>,
    },
    Receive {
        session_id: SessionId,
        max_messages: u32,
        max_wait_ms: u64,
    },
    ReceiveBySequenceNumbers {
        session_id: SessionId,
        sequence_numbers: Vec<i64>,
    },
    Peek {
        session_id: SessionId,
        from_sequence_number: i64,
        max_messages: u32,
    },
    Settle {
        session_id: SessionId,
        target: MessageRef,
        disposition: Disposition,
    },
    GetSessionState {
        session_id: SessionId,
    },
    SetSessionState {
        session_id: SessionId,
        #[serde(with = "base64_bytes::option")]
        state: Option<Vec<u8>>,
    },
    CloseSession {
        session_id: SessionId,
    },
}

impl RequestBody {
    /// Operation name used in logs and timeout messages.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::AcceptSession { .. } => "accept_session",
            Self::RenewSessionLock { .. } => "renew_session_lock",
            Self::RenewMessageLock { .. } => "renew_message_lock",
            Self::Receive { .. } => "receive",
            Self::ReceiveBySequenceNumbers { .. } => "receive_by_sequence_numbers",
            Self::Peek { .. } => "peek",
            Self::Settle { .. } => "settle",
            Self::GetSessionState { .. } => "get_session_state",
            Self::SetSessionState { .. } => "set_session_state",
            Self::CloseSession { .. } => "close_session",
        }
    }
}

/// Settlement outcome requested for a locked message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
    Complete,
    Abandon {
        #[serde(default)]
        properties_to_modify: Properties,
    },
    Defer {
        #[serde(default)]
        properties_to_modify: Properties,
    },
    DeadLetter(DeadLetterOptions),
}

impl Disposition {
    /// Disposition name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon { .. } => "abandon",
            Self::Defer { .. } => "defer",
            Self::DeadLetter(_) => "dead_letter",
        }
    }
}

/// Response received from the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub correlation_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResponseBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ResponseFrame {
    /// Build a frame from a handler outcome.
    #[must_use]
    pub fn from_outcome(correlation_id: u64, outcome: Result<ResponseBody, ErrorPayload>) -> Self {
        match outcome {
            Ok(body) => Self {
                correlation_id,
                result: Some(body),
                error: None,
            },
            Err(error) => Self {
                correlation_id,
                result: None,
                error: Some(error),
            },
        }
    }

    /// Convert into the caller-facing result.
    ///
    /// # Errors
    /// Returns the broker error, or a protocol error for an empty frame.
    pub fn into_result(self) -> Result<ResponseBody, Error> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error.into_error()),
            (Some(body), None) => Ok(body),
            (None, None) => Err(Error::Protocol(format!(
                "response {} carries neither result nor error",
                self.correlation_id
            ))),
        }
    }
}

/// Response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    SessionAccepted {
        session_id: SessionId,
        locked_until: DateTime<Utc>,
    },
    LockRenewed {
        locked_until: DateTime<Utc>,
    },
    Messages {
        messages: Vec<ReceivedMessage>,
    },
    SessionState {
        #[serde(with = "base64_bytes::option")]
        state: Option<Vec<u8>>,
    },
    Ack,
}

impl ResponseBody {
    /// Response name used in protocol errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionAccepted { .. } => "session_accepted",
            Self::LockRenewed { .. } => "lock_renewed",
            Self::Messages { .. } => "messages",
            Self::SessionState { .. } => "session_state",
            Self::Ack => "ack",
        }
    }
}

/// Broker-side failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCondition {
    Timeout,
    ServerBusy,
    SessionLockLost,
    MessageLockLost,
    SessionCannotBeLocked,
    MessageNotFound,
    EntityNotFound,
    StateTooLarge,
    Unauthorized,
    InvalidOperation,
    Internal,
}

/// Error payload carried by a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub condition: ErrorCondition,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<MessageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<(usize, usize)>,
}

impl ErrorPayload {
    /// Create a payload without session context.
    #[must_use]
    pub fn new(condition: ErrorCondition, message: impl Into<String>) -> Self {
        Self {
            condition,
            message: message.into(),
            session_id: None,
            target: None,
            size: None,
        }
    }

    /// Attach the session the failure concerns.
    #[must_use]
    pub fn in_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach the message the failure concerns.
    #[must_use]
    pub const fn for_target(mut self, target: MessageRef) -> Self {
        self.target = Some(target);
        self
    }

    /// Attach the offending and maximum sizes.
    #[must_use]
    pub const fn with_size(mut self, size: usize, max: usize) -> Self {
        self.size = Some((size, max));
        self
    }

    /// Convert to the client error taxonomy.
    #[must_use]
    pub fn into_error(self) -> Error {
        let session_id = self.session_id.unwrap_or_default();
        match self.condition {
            ErrorCondition::Timeout => Error::Timeout(self.message),
            ErrorCondition::ServerBusy | ErrorCondition::Internal => {
                Error::Communication(self.message)
            }
            ErrorCondition::SessionLockLost => Error::SessionLockLost { session_id },
            ErrorCondition::MessageLockLost => match self.target {
                Some(target) => Error::MessageLockLost { session_id, target },
                None => Error::Protocol(format!(
                    "message lock lost without a target: {}",
                    self.message
                )),
            },
            ErrorCondition::SessionCannotBeLocked => Error::SessionCannotBeLocked { session_id },
            ErrorCondition::MessageNotFound => match self.target {
                Some(MessageRef::SequenceNumber(sequence_number)) => Error::MessageNotFound {
                    session_id,
                    sequence_number,
                },
                _ => Error::Protocol(format!(
                    "message not found without a sequence number: {}",
                    self.message
                )),
            },
            ErrorCondition::EntityNotFound => Error::EntityNotFound(self.message),
            ErrorCondition::StateTooLarge => {
                let (size, max) = self.size.unwrap_or_default();
                Error::StateTooLarge {
                    session_id,
                    size,
                    max,
                }
            }
            ErrorCondition::Unauthorized => Error::Unauthorized(self.message),
            ErrorCondition::InvalidOperation => Error::InvalidOperation(self.message),
        }
    }
}

/// Serde adapter encoding byte payloads as base64 strings.
pub mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }

    /// Same encoding for optional payloads; `None` is `null`.
    pub mod option {
        use super::BASE64;
        use base64::Engine as _;
        use serde::{Deserialize, Deserializer, Serializer};

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| BASE64.decode(encoded).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
