//! Session acquisition and session-lock lifecycle.
//!
//! Provides:
//! - `SessionAcceptor` - Negotiate exclusive ownership of a session
//! - `MessageSession` - Receive, settle, renew and keep state under the lock
//! - `AutoRenewGuard` - Background session-lock renewal
//! - `InMemoryBroker` - In-process broker for tests and development (feature `memory`)

pub mod acceptor;
mod blocking;
pub mod broker;
pub mod handle;
mod lifecycle;
mod receive;
mod renewal;
mod settlement;
mod state;

pub use acceptor::SessionAcceptor;
#[cfg(feature = "memory")]
pub use broker::InMemoryBroker;
pub use broker::{BrokerConfig, EntityDescription, EntityKind, Fault};
pub use handle::MessageSession;
pub use receive::DEFAULT_RECEIVE_WAIT;
pub use renewal::AutoRenewGuard;
