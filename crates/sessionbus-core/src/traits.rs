//! Collaborator traits: link transport and credentials.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::{
    ClientSettings,
    error::{Error, Result},
    protocol::{RequestFrame, ResponseFrame},
};

/// Token presented when opening a link.
#[derive(Clone)]
pub struct SecurityToken {
    /// Opaque token value.
    pub token: String,
    /// Audience the token was issued for.
    pub audience: String,
    /// Expiry, if known.
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityToken")
            .field("audience", &self.audience)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Trait for credential sources.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Get a token for the given audience (an entity path).
    async fn get_token(&self, audience: &str) -> Result<SecurityToken>;
}

/// Token provider returning a fixed token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Create a provider for a pre-issued token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, audience: &str) -> Result<SecurityToken> {
        if self.token.is_empty() {
            return Err(Error::Unauthorized("no token configured".to_string()));
        }
        Ok(SecurityToken {
            token: self.token.clone(),
            audience: audience.to_string(),
            expires_at: None,
        })
    }
}

/// Outbound half of a request/response link.
#[async_trait]
pub trait LinkSender: Send + Sync {
    /// Send one request frame.
    async fn send(&self, frame: RequestFrame) -> Result<()>;

    /// Close the link. Must be idempotent.
    async fn close(&self);
}

/// An open request/response link bound to one entity.
pub struct Link {
    /// Outbound frames.
    pub sender: Box<dyn LinkSender>,
    /// Inbound frames; ends when the remote side closes the link.
    pub inbound: mpsc::UnboundedReceiver<ResponseFrame>,
}

/// Trait for link transports.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Open a request/response link to an entity.
    async fn open_link(&self, entity_path: &str, settings: &ClientSettings) -> Result<Link>;
}
