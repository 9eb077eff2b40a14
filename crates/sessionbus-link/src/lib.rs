//! Request/response channel for session links.
//!
//! Provides:
//! - `RequestResponseChannel` - Multiplexes many in-flight requests over one link
//! - `PendingTable` - Correlation-id keyed slots, each resolved exactly once

pub mod channel;
pub mod pending;

#[cfg(test)]
mod fake;

pub use channel::{PendingResponse, RequestResponseChannel};
pub use pending::PendingTable;
