//! In-flight action registry.
//!
//! The table maps each `ActionID` to a one-shot completion slot. Publishers
//! register before their frame is queued for the wire; the connection reader
//! resolves entries as responses arrive. Dropping the [`PendingGuard`]
//! returned by [`PendingActions::register`] removes the entry if it still
//! holds that registration, which makes cancellation and timeouts safe: the
//! slot disappears with the waiter, and a late response falls through to the
//! broadcast stream.
//!
//! Rust guideline compliant 2026-02

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{AmiError, AmiResult};
use crate::message::AmiMessage;

/// One registered in-flight action.
#[derive(Debug)]
struct PendingEntry {
    /// Distinguishes this registration from a later reuse of the same ID.
    token: u64,
    /// Registration time, reported when teardown fails the action.
    submitted_at: Instant,
    /// Dropping the sender fails the waiter.
    complete: oneshot::Sender<AmiMessage>,
}

/// Mutex-guarded table of pending actions, shared by publishers and the
/// connection reader.
#[derive(Debug)]
pub(crate) struct PendingActions {
    entries: Mutex<HashMap<String, PendingEntry>>,
    next_token: AtomicU64,
    next_action_id: AtomicU64,
}

impl PendingActions {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            next_action_id: AtomicU64::new(1),
        }
    }

    /// Generate the next correlation identifier (`"1"`, `"2"`, ...).
    pub fn next_id(&self) -> String {
        self.next_action_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Register a waiter for `id`. The returned guard must stay alive while
    /// the caller awaits the receiver.
    ///
    /// # Errors
    ///
    /// Returns [`AmiError::CorrelationCollision`] if `id` is already pending.
    pub fn register(
        &self,
        id: &str,
    ) -> AmiResult<(PendingGuard<'_>, oneshot::Receiver<AmiMessage>)> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().expect("pending table lock poisoned");
        match entries.entry(id.to_string()) {
            Entry::Occupied(_) => Err(AmiError::CorrelationCollision(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    token,
                    submitted_at: Instant::now(),
                    complete: tx,
                });
                Ok((
                    PendingGuard {
                        table: self,
                        id: id.to_string(),
                        token,
                    },
                    rx,
                ))
            }
        }
    }

    /// Resolve `id` with `response`, removing the entry. Returns true if a
    /// waiter was registered. A failed send (the waiter gave up between
    /// arrival and delivery) is not an error; the entry is gone either way.
    pub fn resolve(&self, id: &str, response: AmiMessage) -> bool {
        let entry = self
            .entries
            .lock()
            .expect("pending table lock poisoned")
            .remove(id);
        match entry {
            Some(entry) => {
                let _ = entry.complete.send(response);
                true
            }
            None => false,
        }
    }

    /// Remove `id` only if it still holds the registration identified by
    /// `token`. A later registration under the same identifier is left alone.
    fn remove_if_token(&self, id: &str, token: u64) {
        let mut entries = self.entries.lock().expect("pending table lock poisoned");
        if entries.get(id).is_some_and(|entry| entry.token == token) {
            entries.remove(id);
        }
    }

    /// Drop every entry, failing all waiters. Returns how many were pending.
    pub fn fail_all(&self) -> usize {
        let mut entries = self.entries.lock().expect("pending table lock poisoned");
        let count = entries.len();
        for (id, entry) in entries.drain() {
            log::debug!(
                "[AmiClient] Failing action {id} pending for {:?}",
                entry.submitted_at.elapsed()
            );
        }
        count
    }
}

/// Removes its registration when dropped, unless the reader already resolved
/// it or a new registration superseded it.
#[derive(Debug)]
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingActions,
    id: String,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove_if_token(&self.id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_response(id: &str) -> AmiMessage {
        [("Response", "Success"), ("ActionID", id)].into_iter().collect()
    }

    #[tokio::test]
    async fn register_then_resolve_delivers_response() {
        let table = PendingActions::new();
        let (_guard, rx) = table.register("1").unwrap();
        assert!(table.resolve("1", success_response("1")));
        let response = rx.await.unwrap();
        assert_eq!(response.get("Response"), Some("Success"));
    }

    #[test]
    fn collision_is_rejected() {
        let table = PendingActions::new();
        let (_guard, _rx) = table.register("dup").unwrap();
        assert!(matches!(
            table.register("dup"),
            Err(AmiError::CorrelationCollision(id)) if id == "dup"
        ));
    }

    #[test]
    fn resolve_unknown_returns_false() {
        let table = PendingActions::new();
        assert!(!table.resolve("ghost", success_response("ghost")));
    }

    #[test]
    fn dropping_guard_frees_identifier() {
        let table = PendingActions::new();
        let (guard, rx) = table.register("77").unwrap();
        drop(guard);
        drop(rx);
        assert!(table.register("77").is_ok());
    }

    #[test]
    fn stale_guard_cannot_remove_successor() {
        let table = PendingActions::new();
        let (stale_guard, _rx1) = table.register("9").unwrap();
        assert!(table.resolve("9", success_response("9")));

        let (_guard2, _rx2) = table.register("9").unwrap();
        drop(stale_guard);
        // The second registration must survive the stale guard's drop.
        assert!(table.resolve("9", success_response("9")));
    }

    #[tokio::test]
    async fn fail_all_fails_waiters() {
        let table = PendingActions::new();
        let (_g1, rx1) = table.register("1").unwrap();
        let (_g2, rx2) = table.register("2").unwrap();
        assert_eq!(table.fail_all(), 2);
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
    }

    #[test]
    fn next_id_counts_from_one() {
        let table = PendingActions::new();
        assert_eq!(table.next_id(), "1");
        assert_eq!(table.next_id(), "2");
        assert_eq!(table.next_id(), "3");
    }
}
