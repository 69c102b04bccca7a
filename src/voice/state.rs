//! Session state shared between the speech components
//!
//! The turn coordinator owns the only [`SessionStateMachine`]. Every other
//! component gets a read-only [`StateHandle`] for gating.

use tokio::sync::watch;

use crate::{Error, Result};

/// Where the session is in the listen/speak cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// Not started, or shut down
    #[default]
    Idle,
    /// Waiting for the user to finish an utterance
    Listening,
    /// Waiting for the responder
    Processing,
    /// Playing synthesized speech
    Speaking,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Listening)
                | (Self::Listening, Self::Processing)
                | (Self::Processing, Self::Speaking | Self::Listening)
                | (Self::Speaking, Self::Listening)
                | (_, Self::Idle)
        )
    }
}

/// Sole writer of the session state
pub struct SessionStateMachine {
    tx: watch::Sender<SessionState>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Create a state machine in [`SessionState::Idle`]
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Idle);
        Self { tx }
    }

    /// Read-only handle for other components
    #[must_use]
    pub fn handle(&self) -> StateHandle {
        StateHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Current state
    #[must_use]
    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the move is not allowed;
    /// the state is left unchanged
    pub fn transition(&self, next: SessionState) -> Result<()> {
        let from = self.current();
        if from == next {
            return Ok(());
        }
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }

        self.tx.send_replace(next);
        tracing::debug!(?from, to = ?next, "session state changed");
        Ok(())
    }
}

/// Read-only view of the session state
#[derive(Clone)]
pub struct StateHandle {
    rx: watch::Receiver<SessionState>,
}

impl StateHandle {
    /// Current state
    #[must_use]
    pub fn current(&self) -> SessionState {
        *self.rx.borrow()
    }

    /// Whether the assistant is speaking right now
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.current() == SessionState::Speaking
    }

    /// Wait until the state equals `state`
    ///
    /// Returns immediately if it already does.
    pub async fn wait_for(&mut self, state: SessionState) {
        // Err only if the state machine is gone, which ends the session anyway
        let _ = self.rx.wait_for(|s| *s == state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_cycle_is_legal() {
        let sm = SessionStateMachine::new();
        assert_eq!(sm.current(), SessionState::Idle);

        sm.transition(SessionState::Listening).unwrap();
        sm.transition(SessionState::Processing).unwrap();
        sm.transition(SessionState::Speaking).unwrap();
        sm.transition(SessionState::Listening).unwrap();
        sm.transition(SessionState::Processing).unwrap();
        sm.transition(SessionState::Listening).unwrap();
        sm.transition(SessionState::Idle).unwrap();
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let sm = SessionStateMachine::new();

        assert!(matches!(
            sm.transition(SessionState::Speaking),
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(sm.current(), SessionState::Idle);

        sm.transition(SessionState::Listening).unwrap();
        assert!(sm.transition(SessionState::Speaking).is_err());
        assert_eq!(sm.current(), SessionState::Listening);
    }

    #[test]
    fn test_any_state_can_stop() {
        for state in [
            SessionState::Listening,
            SessionState::Processing,
            SessionState::Speaking,
        ] {
            assert!(state.can_transition_to(SessionState::Idle));
        }
    }

    #[test]
    fn test_handle_sees_writes() {
        let sm = SessionStateMachine::new();
        let handle = sm.handle();

        sm.transition(SessionState::Listening).unwrap();
        assert_eq!(handle.current(), SessionState::Listening);
        assert!(!handle.is_speaking());

        sm.transition(SessionState::Processing).unwrap();
        sm.transition(SessionState::Speaking).unwrap();
        assert!(handle.is_speaking());
    }

    #[tokio::test]
    async fn test_wait_for_state() {
        let sm = SessionStateMachine::new();
        let mut handle = sm.handle();

        let waiter = tokio::spawn(async move {
            handle.wait_for(SessionState::Listening).await;
        });
        sm.transition(SessionState::Listening).unwrap();
        waiter.await.unwrap();
    }
}
