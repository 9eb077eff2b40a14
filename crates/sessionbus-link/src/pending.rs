//! Pending-response slots keyed by correlation id.

use std::collections::HashMap;

use parking_lot::Mutex;
use sessionbus_core::{Error, Result, protocol::ResponseBody};
use tokio::sync::oneshot;

type Slot = oneshot::Sender<Result<ResponseBody>>;

/// Arena of pending-response slots.
///
/// A slot is inserted by exactly one requester and removed exactly once:
/// by the dispatcher when its response arrives, by the requester when it
/// stops waiting, or by `fail_all`. Whoever removes it is its only writer.
#[derive(Default)]
pub struct PendingTable {
    slots: Mutex<HashMap<u64, Slot>>,
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot and return the receiving half.
    ///
    /// # Errors
    /// Returns a protocol error if the id is already pending.
    pub fn register(&self, correlation_id: u64) -> Result<oneshot::Receiver<Result<ResponseBody>>> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock();
        if slots.contains_key(&correlation_id) {
            return Err(Error::Protocol(format!(
                "correlation id {correlation_id} is already pending"
            )));
        }
        slots.insert(correlation_id, tx);
        Ok(rx)
    }

    /// Resolve a slot. Returns `false` if no such slot is pending.
    pub fn resolve(&self, correlation_id: u64, result: Result<ResponseBody>) -> bool {
        let slot = self.slots.lock().remove(&correlation_id);
        slot.is_some_and(|tx| {
            // Receiver may have been dropped; the slot is resolved either way.
            let _ = tx.send(result);
            true
        })
    }

    /// Remove a slot without resolving it.
    pub fn cancel(&self, correlation_id: u64) -> bool {
        self.slots.lock().remove(&correlation_id).is_some()
    }

    /// Resolve every pending slot with an error built by `make_error`.
    ///
    /// Returns the number of slots failed.
    pub fn fail_all(&self, make_error: impl Fn() -> Error) -> usize {
        let drained: Vec<Slot> = self.slots.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(make_error()));
        }
        count
    }

    /// Number of pending slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no slot is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_responses_route_by_id() {
        let table = PendingTable::new();
        let rx1 = table.register(1).unwrap();
        let rx2 = table.register(2).unwrap();

        // Out of order.
        assert!(table.resolve(2, Ok(ResponseBody::Ack)));
        assert!(table.resolve(
            1,
            Err(Error::SessionLockLost {
                session_id: "s".into()
            })
        ));

        assert!(matches!(rx2.await.unwrap(), Ok(ResponseBody::Ack)));
        assert!(rx1.await.unwrap().unwrap_err().is_session_lock_lost());
        assert!(table.is_empty());
    }

    #[test]
    fn test_slot_resolves_once() {
        let table = PendingTable::new();
        let _rx = table.register(9).unwrap();
        assert!(table.resolve(9, Ok(ResponseBody::Ack)));
        assert!(!table.resolve(9, Ok(ResponseBody::Ack)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let table = PendingTable::new();
        let _rx = table.register(4).unwrap();
        assert!(matches!(table.register(4), Err(Error::Protocol(_))));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_drains() {
        let table = PendingTable::new();
        let receivers: Vec<_> = (0..3).map(|id| table.register(id).unwrap()).collect();

        let failed = table.fail_all(|| Error::Communication("link closed".into()));
        assert_eq!(failed, 3);
        assert!(table.is_empty());

        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(Error::Communication(_))));
        }
    }

    #[test]
    fn test_cancel_removes_without_resolving() {
        let table = PendingTable::new();
        let mut rx = table.register(5).unwrap();
        assert!(table.cancel(5));
        assert!(!table.resolve(5, Ok(ResponseBody::Ack)));
        // Sender dropped without a value.
        assert!(rx.try_recv().is_err());
    }
}
