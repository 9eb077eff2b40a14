//! Broker implementations.

#[cfg(feature = "memory")]
mod entity;
#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::InMemoryBroker;

use std::time::Duration;

/// Broker-side limits.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Duration of a session lock from acceptance or renewal.
    pub lock_duration: Duration,
    /// Largest session state accepted.
    pub max_state_bytes: usize,
    /// Deliveries after which a message is dead-lettered.
    pub max_delivery_count: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_state_bytes: 256 * 1024,
            max_delivery_count: 10,
        }
    }
}

/// Kind of messaging entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    Queue,
    /// Fans out every message to its subscriptions; not receivable itself.
    Topic,
    Subscription { topic: String },
}

/// Entity to provision.
#[derive(Debug, Clone)]
pub struct EntityDescription {
    pub path: String,
    pub kind: EntityKind,
    /// Whether messages are grouped into lockable sessions.
    pub requires_session: bool,
}

impl EntityDescription {
    /// A session-enabled queue.
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            path: name.into(),
            kind: EntityKind::Queue,
            requires_session: true,
        }
    }

    /// A topic.
    #[must_use]
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            path: name.into(),
            kind: EntityKind::Topic,
            requires_session: false,
        }
    }

    /// A session-enabled subscription at `{topic}/subscriptions/{name}`.
    #[must_use]
    pub fn subscription(topic: impl Into<String>, name: &str) -> Self {
        let topic = topic.into();
        Self {
            path: format!("{topic}/subscriptions/{name}"),
            kind: EntityKind::Subscription { topic },
            requires_session: true,
        }
    }

    /// Set whether the entity requires sessions.
    #[must_use]
    pub const fn with_requires_session(mut self, requires_session: bool) -> Self {
        self.requires_session = requires_session;
        self
    }
}

/// Fault injected into the next request a broker link receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer with a transient server-busy error.
    ServerBusy,
    /// Accept the request and never answer it.
    DropResponse,
    /// Apply the request at once but hold its answer back for this long.
    DelayResponse(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_path() {
        let sub = EntityDescription::subscription("events", "audit");
        assert_eq!(sub.path, "events/subscriptions/audit");
        assert_eq!(
            sub.kind,
            EntityKind::Subscription {
                topic: "events".to_string()
            }
        );
        assert!(sub.requires_session);
    }

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.lock_duration, Duration::from_secs(30));
        assert_eq!(config.max_state_bytes, 262_144);
    }
}
