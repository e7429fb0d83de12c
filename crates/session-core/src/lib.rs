//! Core session contract shared between the engine runtime and frontend
//! consumers.
//!
//! This crate defines the command/event protocol, room/message domain model,
//! timeline merge buffer, lifecycle state machine, reconnect policy, and the
//! common error/channel abstractions. It performs no I/O.

/// Async command/event channel primitives.
pub mod channel;
/// Stable engine error types and recovery classification.
pub mod error;
/// Reconnect pacing used by the session loading loop.
pub mod retry;
/// Session lifecycle state machine.
pub mod state_machine;
/// Timeline merge buffer with identifier-based reconciliation.
pub mod timeline;
/// Frontend-facing protocol types (commands, events, rooms, messages).
pub mod types;

pub use channel::{EventStream, SessionChannelError, SessionChannels};
pub use error::{EngineError, ErrorKind};
pub use retry::ReconnectPolicy;
pub use state_machine::SessionStateMachine;
pub use timeline::{RemoteMerge, Timeline, TimelineMergeError};
pub use types::{
    DeliveryStatus, Message, ROOM_TTL_MS, Room, RoomKind, SessionCommand, SessionEvent,
    SessionLifecycleState, format_time_remaining,
};
