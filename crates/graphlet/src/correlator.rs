//! Request correlator - matches terminal responses to pending callers.
//!
//! Each `send()` registers one entry keyed by a fresh correlation id.
//! Exactly one of {resolved, rejected, timed out} fires per entry, and the
//! entry leaves the table atomically with that firing. Streaming messages
//! never touch this table.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::BridgeError;

/// Terminal outcome delivered to a waiting caller.
pub type RequestOutcome = Result<Value, BridgeError>;

struct Pending {
    tx: oneshot::Sender<RequestOutcome>,
    created_at: Instant,
}

/// Pending-request table with lock-free concurrent access.
#[derive(Default)]
pub struct Correlator {
    pending: DashMap<String, Pending>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request under a fresh correlation id.
    ///
    /// The id is guaranteed unused among current entries; on the
    /// theoretical UUID collision we re-roll.
    pub fn register(&self) -> (String, oneshot::Receiver<RequestOutcome>) {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            match self.pending.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    let (tx, rx) = oneshot::channel();
                    slot.insert(Pending {
                        tx,
                        created_at: Instant::now(),
                    });
                    return (id, rx);
                }
                Entry::Occupied(_) => continue,
            }
        }
    }

    /// Deliver a terminal outcome to the matching caller.
    ///
    /// Returns `false` for an orphan (stale or unknown id) - the caller
    /// logs and discards it. A duplicate terminal for an id that already
    /// settled is an orphan by construction.
    pub fn complete(&self, id: &str, outcome: RequestOutcome) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                // Receiver may have gone away (caller dropped the future).
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without delivering anything. Used when the transport
    /// write fails synchronously and the caller is told inline.
    pub fn discard(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Reject every pending request with the given error.
    ///
    /// Iterates a snapshot of ids, not the live table, so concurrent
    /// completions cannot race a mutate-while-iterate hazard.
    pub fn fail_all(&self, error: BridgeError) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                tracing::debug!(
                    request_id = %id,
                    age_ms = entry.created_at.elapsed().as_millis() as u64,
                    %error,
                    "Rejecting pending request"
                );
                let _ = entry.tx.send(Err(error.clone()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Race the caller's receiver against its timeout.
    ///
    /// First event wins: on timer expiry the request only counts as timed
    /// out if this waiter removed the entry itself. If a terminal response
    /// got there first, its outcome is returned even though the clock also
    /// fired.
    pub async fn wait(
        &self,
        id: &str,
        mut rx: oneshot::Receiver<RequestOutcome>,
        timeout: Duration,
    ) -> RequestOutcome {
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an outcome: table cleared mid-teardown.
            Ok(Err(_)) => Err(BridgeError::ShutdownInProgress),
            Err(_elapsed) => {
                if let Some((_, entry)) = self.pending.remove(id) {
                    tracing::debug!(
                        request_id = %id,
                        age_ms = entry.created_at.elapsed().as_millis() as u64,
                        "Request timed out"
                    );
                    Err(BridgeError::RequestTimeout(timeout))
                } else {
                    // Terminal response won the race; take its outcome.
                    match rx.try_recv() {
                        Ok(outcome) => outcome,
                        Err(_) => Err(BridgeError::RequestTimeout(timeout)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[tokio::test]
    async fn ids_are_unique_among_pending_entries() {
        let correlator = Correlator::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let (id, _rx) = correlator.register();
            assert!(seen.insert(id));
        }
        assert_eq!(correlator.len(), 100);
    }

    #[tokio::test]
    async fn complete_resolves_the_matching_caller_once() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();

        assert!(correlator.complete(&id, Ok(json!({"ok": true}))));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));

        // Duplicate terminal for the same id is a no-op.
        assert!(!correlator.complete(&id, Ok(json!("again"))));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn orphan_terminal_is_discarded_without_panic() {
        let correlator = Correlator::new();
        assert!(!correlator.complete("never-registered", Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_removes_the_entry() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();

        let outcome = correlator.wait(&id, rx, Duration::from_secs(5)).await;
        assert!(matches!(outcome, Err(BridgeError::RequestTimeout(_))));
        assert!(correlator.is_empty());

        // A terminal arriving after the timeout has no effect.
        assert!(!correlator.complete(&id, Ok(json!("late"))));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_wins_a_tie_with_the_clock() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();

        // Outcome already delivered when the (zero-length) timer fires.
        assert!(correlator.complete(&id, Err(BridgeError::Worker("boom".into()))));
        let outcome = correlator.wait(&id, rx, Duration::ZERO).await;
        assert!(matches!(outcome, Err(BridgeError::Worker(_))));
    }

    #[tokio::test]
    async fn fail_all_rejects_every_entry_exactly_once() {
        let correlator = Correlator::new();
        let (_, rx1) = correlator.register();
        let (_, rx2) = correlator.register();

        correlator.fail_all(BridgeError::ShutdownInProgress);
        assert!(correlator.is_empty());

        assert!(matches!(
            rx1.await.unwrap(),
            Err(BridgeError::ShutdownInProgress)
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(BridgeError::ShutdownInProgress)
        ));
    }

    #[tokio::test]
    async fn discard_drops_without_delivery() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();

        assert!(correlator.discard(&id));
        assert!(rx.await.is_err());
    }
}
