use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionLifecycleState;

/// Broad error class used for user-facing handling and recovery behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    /// Room code generation or directory write failure.
    Directory,
    /// Unknown or expired room code.
    NotFound,
    /// History retrieval failure, recovered via the local cache.
    Fetch,
    /// Message write failure, surfaced per-message with manual retry.
    Send,
    /// Live subscription failure, recovered via the timed reconnect loop.
    Channel,
    /// Local persistence failure.
    Storage,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind:?}:{code}: {message}")]
pub struct EngineError {
    /// High-level error class.
    pub kind: ErrorKind,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl EngineError {
    /// Construct a new engine error.
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SessionLifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorKind::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is in state {current:?}"),
        )
    }

    /// Whether the engine keeps recovering from this error on its own.
    ///
    /// History-fetch failures fall back to the cache and channel failures
    /// feed the reconnect loop; everything else needs an explicit user
    /// action.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind, ErrorKind::Fetch | ErrorKind::Channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = EngineError::invalid_state(SessionLifecycleState::Uninitialized, "send_message");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn recoverable_kinds_are_limited_to_fetch_and_channel() {
        assert!(EngineError::new(ErrorKind::Fetch, "f", "fetch").is_recoverable());
        assert!(EngineError::new(ErrorKind::Channel, "c", "channel").is_recoverable());
        assert!(!EngineError::new(ErrorKind::Send, "s", "send").is_recoverable());
        assert!(!EngineError::new(ErrorKind::NotFound, "n", "not found").is_recoverable());
        assert!(!EngineError::new(ErrorKind::Directory, "d", "directory").is_recoverable());
    }
}
