//! Registry of outbound calls awaiting their `return` message.

use crate::{Result, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

pub(crate) type Completion = oneshot::Receiver<Result<Value>>;

/// Call-id allocator plus the id → completion table.
///
/// Ids increase monotonically for the lifetime of the registry and are never
/// handed out twice.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    next_id: u64,
    calls: HashMap<u64, oneshot::Sender<Result<Value>>>,
}

impl PendingCalls {
    /// Allocate the next id and register a completion for it.
    pub(crate) fn register(&mut self) -> (u64, Completion) {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.calls.insert(id, tx);
        (id, rx)
    }

    /// Resolve the call with `id`. Returns false when no such call is pending.
    pub(crate) fn complete(&mut self, id: u64, result: Result<Value>) -> bool {
        match self.calls.remove(&id) {
            Some(tx) => {
                // The caller may have given up already; that is not an error here.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.calls.remove(&id);
    }

    /// Reject every pending call with `Stopped`, returning how many there were.
    pub(crate) fn reject_all(&mut self) -> usize {
        let count = self.calls.len();
        for (_, tx) in self.calls.drain() {
            let _ = tx.send(Err(RpcError::Stopped));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_monotonic_and_unique() {
        let mut pending = PendingCalls::default();
        let (a, _ra) = pending.register();
        let (b, _rb) = pending.register();
        pending.remove(a);
        let (c, _rc) = pending.register();

        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_complete_resolves_only_matching_id() {
        let mut pending = PendingCalls::default();
        let (first, first_rx) = pending.register();
        let (second, second_rx) = pending.register();

        assert!(pending.complete(second, Ok(json!("second"))));
        assert!(pending.complete(first, Ok(json!("first"))));
        assert!(!pending.complete(first, Ok(json!("again"))));

        assert_eq!(first_rx.await.unwrap().unwrap(), json!("first"));
        assert_eq!(second_rx.await.unwrap().unwrap(), json!("second"));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_reject_all_drains_table() {
        let mut pending = PendingCalls::default();
        let (_, rx1) = pending.register();
        let (_, rx2) = pending.register();

        assert_eq!(pending.reject_all(), 2);
        assert_eq!(pending.len(), 0);
        assert!(matches!(rx1.await.unwrap(), Err(RpcError::Stopped)));
        assert!(matches!(rx2.await.unwrap(), Err(RpcError::Stopped)));
    }

    #[test]
    fn test_complete_after_receiver_dropped() {
        let mut pending = PendingCalls::default();
        let (id, rx) = pending.register();
        drop(rx);

        assert!(pending.complete(id, Ok(json!(1))));
        assert_eq!(pending.len(), 0);
    }
}
