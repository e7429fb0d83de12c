use crate::{error::EngineError, types::SessionLifecycleState};

/// Session lifecycle state machine.
///
/// `Uninitialized -> Loading -> Live <-> Reconnecting` with `Closed`
/// reachable from every state. A closed session may be re-activated, which
/// starts a fresh loading cycle for the next room.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionLifecycleState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionLifecycleState::Uninitialized,
        }
    }
}

impl SessionStateMachine {
    pub fn state(&self) -> SessionLifecycleState {
        self.state
    }

    /// Sends are permitted while live or degraded, never before activation
    /// or after teardown.
    pub fn can_send(&self) -> bool {
        matches!(
            self.state,
            SessionLifecycleState::Live | SessionLifecycleState::Reconnecting
        )
    }

    /// Start (or restart) the loading sequence: history fetch plus channel
    /// setup. Valid on first activation, on each reconnect attempt, and when
    /// re-activating after teardown.
    pub fn begin_loading(&mut self) -> Result<SessionLifecycleState, EngineError> {
        self.transition_from_any_of(
            &[
                SessionLifecycleState::Uninitialized,
                SessionLifecycleState::Reconnecting,
                SessionLifecycleState::Closed,
            ],
            SessionLifecycleState::Loading,
            "begin_loading",
        )
    }

    /// The live channel is established.
    pub fn mark_live(&mut self) -> Result<SessionLifecycleState, EngineError> {
        self.transition_from_any_of(
            &[SessionLifecycleState::Loading],
            SessionLifecycleState::Live,
            "mark_live",
        )
    }

    /// The live channel failed while being established or maintained.
    pub fn mark_reconnecting(&mut self) -> Result<SessionLifecycleState, EngineError> {
        self.transition_from_any_of(
            &[SessionLifecycleState::Loading, SessionLifecycleState::Live],
            SessionLifecycleState::Reconnecting,
            "mark_reconnecting",
        )
    }

    /// Tear down; valid from any state. Returns `false` when the session was
    /// already closed, so repeated teardown emits nothing.
    pub fn close(&mut self) -> bool {
        if self.state == SessionLifecycleState::Closed {
            return false;
        }
        self.state = SessionLifecycleState::Closed;
        true
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SessionLifecycleState],
        next: SessionLifecycleState,
        action: &str,
    ) -> Result<SessionLifecycleState, EngineError> {
        if !expected.contains(&self.state) {
            return Err(EngineError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}
