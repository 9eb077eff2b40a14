//! Core abstractions for session-locked message consumption.
//!
//! This crate provides the building blocks shared by every layer:
//! - `Message` / `ReceivedMessage` - Outgoing and delivered messages
//! - `protocol` - Typed request/response frames exchanged over a link
//! - `Error` - Error taxonomy with transient/fatal classification
//! - `ClientSettings` and `RetryPolicy` - Configuration consumed by the client
//! - `LinkFactory` and `TokenProvider` traits for external collaborators

pub mod error;
pub mod message;
pub mod protocol;
pub mod retry;
pub mod settings;
pub mod traits;

pub use error::{Error, MessageRef, Result};
pub use message::{
    DeadLetterOptions, HandleState, LockToken, Message, Properties, ReceiveMode,
    ReceivedMessage, SessionId,
};
pub use retry::RetryPolicy;
pub use settings::ClientSettings;
pub use traits::{Link, LinkFactory, LinkSender, SecurityToken, StaticTokenProvider, TokenProvider};
