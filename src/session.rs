//! Session lifecycle states.

use std::sync::{Arc, RwLock as StdRwLock};

/// Lifecycle of a manager session.
///
/// ```text
/// Disconnected -> Handshaking -> Authenticating -> Ready -> Closing -> Closed
/// ```
///
/// `Closed` is terminal and reachable from every other state (transport
/// closure, fatal decode failure, or an explicit close). A rejected login
/// stays in `Authenticating`; a rejected logoff stays in `Ready`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// No transport attached yet.
    #[default]
    Disconnected,
    /// Transport attached; waiting for the server banner.
    Handshaking,
    /// Banner accepted; not yet logged in.
    Authenticating,
    /// Logged in; full publish/subscribe functionality available.
    Ready,
    /// Logoff accepted; teardown in progress.
    Closing,
    /// Terminal: transport released, reader stopped, pending actions failed.
    Closed,
}

/// Session state shared between the client handle and its background tasks.
#[derive(Debug, Default)]
pub(crate) struct SharedSessionState {
    state: StdRwLock<SessionState>,
}

impl SharedSessionState {
    /// Create new shared state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the current state.
    pub fn get(&self) -> SessionState {
        *self.state.read().expect("session state lock poisoned")
    }

    /// Set the state. `Closed` is terminal: once reached, later transitions
    /// are ignored.
    pub fn set(&self, new_state: SessionState) {
        let mut state = self.state.write().expect("session state lock poisoned");
        if *state == SessionState::Closed {
            return;
        }
        *state = new_state;
    }

    /// Transition to `Closed`. Returns false if the session was already
    /// closed, so teardown runs exactly once.
    pub fn close(&self) -> bool {
        let mut state = self.state.write().expect("session state lock poisoned");
        if *state == SessionState::Closed {
            return false;
        }
        *state = SessionState::Closed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_disconnected() {
        let shared = SharedSessionState::new();
        assert_eq!(shared.get(), SessionState::Disconnected);
    }

    #[test]
    fn close_reports_first_transition_only() {
        let shared = SharedSessionState::new();
        shared.set(SessionState::Ready);
        assert!(shared.close());
        assert!(!shared.close());
        assert_eq!(shared.get(), SessionState::Closed);
    }

    #[test]
    fn closed_is_terminal() {
        let shared = SharedSessionState::new();
        shared.close();
        shared.set(SessionState::Ready);
        assert_eq!(shared.get(), SessionState::Closed);
    }
}
