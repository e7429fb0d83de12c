use serde::{Deserialize, Serialize};

/// Fixed room lifetime: rooms expire 4 hours after creation.
pub const ROOM_TTL_MS: u64 = 4 * 60 * 60 * 1000;

/// Room shape reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomKind {
    /// Two-party room (`single` in the store schema).
    #[serde(rename = "single")]
    Direct,
    /// Multi-party room.
    #[serde(rename = "group")]
    Group,
}

/// A code-gated ephemeral chat room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    /// Store-assigned room identifier.
    pub id: String,
    /// Room shape.
    #[serde(rename = "type")]
    pub kind: RoomKind,
    /// One-time join code, 6 ASCII digits.
    #[serde(rename = "otp")]
    pub code: String,
    /// Creation timestamp in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Expiry timestamp; always `created_at_ms + ROOM_TTL_MS`.
    pub expires_at_ms: u64,
    /// Number of participants that have joined so far.
    pub active_participants: u32,
    /// Timestamp of the last join or message send.
    pub last_activity_ms: u64,
}

impl Room {
    /// A room can be joined while its expiry has not passed.
    pub fn is_joinable(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Per-message delivery status.
///
/// Successful sends move strictly forward through
/// `Pending -> Sent -> Confirmed`; a failed store write parks the entry at
/// `Failed` until an explicit retry resets it to `Pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Optimistically appended; the store write has not resolved yet.
    Pending,
    /// The store accepted the write; the echo/confirm beat is outstanding.
    Sent,
    /// Delivery confirmed (echo observed or confirm delay elapsed).
    Confirmed,
    /// The store write failed; retry is manual.
    Failed,
}

impl DeliveryStatus {
    /// Ordering rank used to forbid backward status transitions.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Confirmed => 2,
            Self::Failed => 3,
        }
    }

    /// Whether the send is still awaiting confirmation.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }
}

/// One timeline entry.
///
/// Exactly one `Message` represents a logical send at any time: an
/// optimistic entry starts with only a `local_id`, and the store-assigned
/// `server_id` is merged into the same entry on confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Store-assigned identifier, present once the write is confirmed.
    pub server_id: Option<String>,
    /// Client-assigned identifier for locally originated sends.
    pub local_id: Option<String>,
    /// Owning room identifier.
    pub room_id: String,
    /// Sender display name.
    pub sender: String,
    /// Plain-text body, non-empty.
    pub content: String,
    /// Creation timestamp in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Delivery status.
    pub status: DeliveryStatus,
}

/// Session lifecycle reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionLifecycleState {
    /// No room has been activated yet.
    Uninitialized,
    /// History fetch and live-channel setup are in progress.
    Loading,
    /// Live updates are flowing.
    Live,
    /// The live channel dropped; a timed retry of the loading sequence is
    /// scheduled.
    Reconnecting,
    /// The session was torn down.
    Closed,
}

/// Command channel input accepted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommand {
    /// Set the display name. Must be non-empty; immutable once set.
    SetDisplayName {
        /// Display name used for sends and typing announcements.
        name: String,
    },
    /// Generate a fresh room code and activate the new room.
    CreateRoom {
        /// Requested room shape.
        kind: RoomKind,
    },
    /// Join an existing room by one-time code and activate it.
    JoinRoom {
        /// 6-digit join code.
        code: String,
    },
    /// Optimistically send a message in the active room.
    SendMessage {
        /// Plain-text body.
        content: String,
    },
    /// Re-attempt a failed send with its original content.
    RetrySend {
        /// Client-assigned identifier of the failed entry.
        local_id: String,
    },
    /// Announce that the local user is typing. The debounced stop broadcast
    /// is the live channel's responsibility.
    AnnounceTyping,
    /// Tear the session down. Safe to issue repeatedly.
    LeaveRoom,
}

/// Event channel output emitted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session lifecycle transition.
    StateChanged {
        /// New lifecycle state.
        state: SessionLifecycleState,
    },
    /// A room was created or joined and is now the active room.
    RoomActivated {
        /// Active room metadata.
        room: Room,
    },
    /// Wholesale timeline replacement after a (re)load.
    TimelineSnapshot {
        /// Messages in display order.
        messages: Vec<Message>,
    },
    /// A message was appended to the timeline end.
    MessageAppended {
        /// The appended entry.
        message: Message,
    },
    /// An existing entry changed (status promotion, id reconciliation).
    MessageUpdated {
        /// The updated entry; correlate by `local_id` or `server_id`.
        message: Message,
    },
    /// Connectivity flag flipped.
    ConnectivityChanged {
        /// `true` while the live channel is established.
        connected: bool,
    },
    /// Full replacement of the currently-typing peer set.
    TypingPeers {
        /// Peer display names, sorted; never contains the local name.
        names: Vec<String>,
    },
    /// Participant presence count for the active room.
    Presence {
        /// Number of currently-connected participants.
        count: u64,
    },
    /// Recoverable or terminal session-level error (the dismissible banner).
    SessionError {
        /// Stable machine-readable error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Whether the engine keeps retrying on its own.
        recoverable: bool,
    },
}

/// Render the time remaining before a room expires, for example `2h 13m`.
pub fn format_time_remaining(expires_at_ms: u64, now_ms: u64) -> String {
    if expires_at_ms <= now_ms {
        return "expired".to_owned();
    }
    let minutes_total = (expires_at_ms - now_ms) / 60_000;
    let hours = minutes_total / 60;
    let minutes = minutes_total % 60;
    if hours == 0 {
        format!("{minutes}m")
    } else {
        format!("{hours}h {minutes}m")
    }
}
