//! Pending call tracking for outbound calls.
//!
//! This module provides the PendingCallTable which allocates correlation IDs
//! and routes incoming replies to their waiters via oneshot channels.
//!
//! - Before writing a call, `allocate()` returns a fresh ID and a Receiver
//! - The reader task calls `resolve()` when a reply for that ID arrives
//! - The caller awaits the Receiver without holding any lock
//! - A caller whose deadline passes calls `expire()`; whichever of
//!   `resolve()`/`expire()` removes the entry first decides the outcome

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{BridgeError, LockResultExt};
use crate::protocol::CorrelationId;

/// Terminal outcome delivered to a waiting caller.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution {
    /// Peer replied `success: true`.
    Success(Value),
    /// Peer replied `success: false` with this message.
    Failure(String),
    /// The connection closed before any reply arrived.
    Closed(String),
}

/// Thread-safe table of outstanding calls, keyed by correlation ID.
pub(crate) struct PendingCallTable {
    state: Mutex<PendingState>,
    next_id: AtomicU64,
}

struct PendingState {
    pending: HashMap<CorrelationId, oneshot::Sender<Resolution>>,
    /// Set once by `close()`; later allocations are refused with this reason.
    closed: Option<String>,
}

impl PendingCallTable {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                pending: HashMap::new(),
                closed: None,
            }),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocate the next correlation ID and insert an unresolved slot for it.
    ///
    /// Fails with `ConnectionClosed` once the table has been closed, so a
    /// caller racing with shutdown never waits on a slot nobody will fill.
    pub(crate) fn allocate(
        &self,
    ) -> Result<(CorrelationId, oneshot::Receiver<Resolution>), BridgeError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().recover_poison("PendingCallTable::allocate");

        if let Some(reason) = &state.closed {
            return Err(BridgeError::connection_closed(reason.clone()));
        }

        let id = CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.pending.insert(id, tx);
        Ok((id, rx))
    }

    /// Deliver an outcome to the waiter for `id`.
    ///
    /// Returns `true` if a waiter received it. Unknown, already resolved, and
    /// already expired IDs are a no-op returning `false`. The send happens
    /// while the lock is held, so an `expire()` that loses the race can rely
    /// on the outcome already being in the channel.
    pub(crate) fn resolve(&self, id: CorrelationId, resolution: Resolution) -> bool {
        let mut state = self.state.lock().recover_poison("PendingCallTable::resolve");
        match state.pending.remove(&id) {
            Some(sender) => sender.send(resolution).is_ok(),
            None => false,
        }
    }

    /// Remove the slot for `id` because its deadline elapsed.
    ///
    /// Returns `true` if the slot was still unresolved (the timeout wins).
    /// Returns `false` if a reply was already delivered.
    pub(crate) fn expire(&self, id: CorrelationId) -> bool {
        self.remove(id, "PendingCallTable::expire")
    }

    /// Remove the slot for `id` without delivering anything.
    ///
    /// Used when the call line could not be written, or when the caller
    /// stopped waiting.
    pub(crate) fn release(&self, id: CorrelationId) -> bool {
        self.remove(id, "PendingCallTable::release")
    }

    fn remove(&self, id: CorrelationId, context: &str) -> bool {
        let mut state = self.state.lock().recover_poison(context);
        state.pending.remove(&id).is_some()
    }

    /// Fail every pending call with `Closed(reason)` and refuse new ones.
    ///
    /// Idempotent: the first reason is kept. Returns how many calls were failed.
    pub(crate) fn close(&self, reason: &str) -> usize {
        let mut state = self.state.lock().recover_poison("PendingCallTable::close");
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }
        let entries: Vec<_> = state.pending.drain().collect();

        // Release lock before sending to avoid holding it during channel operations
        drop(state);

        let count = entries.len();
        for (_, tx) in entries {
            let _ = tx.send(Resolution::Closed(reason.to_string()));
        }
        count
    }

    pub(crate) fn pending_count(&self) -> usize {
        let state = self.state.lock().recover_poison("PendingCallTable::pending_count");
        state.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, id: CorrelationId) -> bool {
        let state = self.state.lock().recover_poison("PendingCallTable::is_pending");
        state.pending.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn new_table_has_no_pending_calls() {
        let table = PendingCallTable::new();
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn allocate_starts_at_zero_and_increments() {
        let table = PendingCallTable::new();
        let (first, _rx1) = table.allocate().unwrap();
        let (second, _rx2) = table.allocate().unwrap();

        assert_eq!(first, CorrelationId::new(0));
        assert_eq!(second, CorrelationId::new(1));
        assert_eq!(table.pending_count(), 2);
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let table = Arc::new(PendingCallTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    // Receivers are kept so every slot stays outstanding
                    (0..250)
                        .map(|_| table.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for (id, _rx) in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 2000);
        assert_eq!(table.pending_count(), 2000);
    }

    #[tokio::test]
    async fn resolve_delivers_outcome_to_waiter() {
        let table = PendingCallTable::new();
        let (id, rx) = table.allocate().unwrap();

        assert!(table.resolve(id, Resolution::Success(json!(5))));
        assert_eq!(rx.await.unwrap(), Resolution::Success(json!(5)));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn second_resolve_is_a_no_op() {
        let table = PendingCallTable::new();
        let (id, _rx) = table.allocate().unwrap();

        assert!(table.resolve(id, Resolution::Success(json!(1))));
        assert!(!table.resolve(id, Resolution::Success(json!(2))));
    }

    #[test]
    fn resolve_unknown_id_returns_false() {
        let table = PendingCallTable::new();
        assert!(!table.resolve(CorrelationId::new(999), Resolution::Success(Value::Null)));
    }

    #[tokio::test]
    async fn resolve_wins_over_later_expire() {
        let table = PendingCallTable::new();
        let (id, rx) = table.allocate().unwrap();

        assert!(table.resolve(id, Resolution::Success(json!("late but real"))));
        assert!(!table.expire(id), "expire after resolve must be a no-op");
        assert_eq!(rx.await.unwrap(), Resolution::Success(json!("late but real")));
    }

    #[test]
    fn expire_wins_over_later_resolve() {
        let table = PendingCallTable::new();
        let (id, _rx) = table.allocate().unwrap();

        assert!(table.expire(id));
        assert!(!table.resolve(id, Resolution::Success(json!(1))));
        assert!(!table.expire(id));
        assert!(!table.is_pending(id));
    }

    #[test]
    fn resolve_after_receiver_dropped_returns_false_and_clears() {
        let table = PendingCallTable::new();
        let (id, rx) = table.allocate().unwrap();
        drop(rx);

        assert!(!table.resolve(id, Resolution::Success(Value::Null)));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn release_removes_without_delivering() {
        let table = PendingCallTable::new();
        let (id, mut rx) = table.allocate().unwrap();

        assert!(table.release(id));
        assert!(!table.release(id));
        assert!(rx.try_recv().is_err(), "nothing should be delivered");
    }

    #[tokio::test]
    async fn close_fails_all_pending_with_reason() {
        let table = PendingCallTable::new();
        let (_, rx1) = table.allocate().unwrap();
        let (_, rx2) = table.allocate().unwrap();
        let (_, rx3) = table.allocate().unwrap();

        assert_eq!(table.close("peer exited"), 3);
        assert_eq!(table.pending_count(), 0);

        for rx in [rx1, rx2, rx3] {
            assert_eq!(rx.await.unwrap(), Resolution::Closed("peer exited".to_string()));
        }
    }

    #[test]
    fn allocate_after_close_is_refused_with_first_reason() {
        let table = PendingCallTable::new();
        table.close("first");
        table.close("second");

        match table.allocate() {
            Err(BridgeError::ConnectionClosed { reason }) => assert_eq!(reason, "first"),
            other => panic!("expected ConnectionClosed, got {:?}", other.map(|(id, _)| id)),
        }
    }
}
